//! Common fakes for migration orchestration integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use migration_orchestration::{
    CancellableMigrationService, CommandInvocation, CommandParameters, CommandStatus,
    DeploymentCallbacks, DeploymentStatusRecorder, Error, InstanceLocator, MigrationEvent,
    MigrationEventListener, Orchestrator, RemoteCommandApi, Result, StackApi, StackParameters,
};
use migration_state::{InfrastructureDeploymentState, MigrationId, MigrationStage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Short poll interval used by watcher and runner tests
pub const FAST_POLL: Duration = Duration::from_millis(10);

/// Application stack name used across tests
pub const APP_STACK: &str = "jira-stack";
/// Helper stack name derived from [`APP_STACK`]
pub const HELPER_STACK: &str = "jira-stack-migration";
/// Nested application stack holding the shared file system
pub const NESTED_STACK: &str = "jira-stack-JiraDCStack-1ABC";
/// Instance of the application stack
pub const APP_INSTANCE: &str = "i-0app";
/// Instance of the helper auto-scaling group
pub const HELPER_INSTANCE: &str = "i-0helper";
/// Document restoring the database
pub const DB_RESTORE_DOCUMENT: &str = "jira-stack-migration-RdsRestore";
/// Bucket in the helper stack outputs
pub const MIGRATION_BUCKET: &str = "jira-stack-migration-bucket";

/// Install a test subscriber once, ignoring repeated calls
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Walk a fresh migration forward until it reaches `target`
pub async fn advance_to(orchestrator: &Orchestrator, target: MigrationStage) {
    let path = [
        MigrationStage::Authentication,
        MigrationStage::ProvisionApplication,
        MigrationStage::ProvisionApplicationWait,
        MigrationStage::ProvisionMigrationStack,
        MigrationStage::ProvisionMigrationStackWait,
        MigrationStage::FsMigrationCopy,
        MigrationStage::FsMigrationCopyWait,
        MigrationStage::OfflineWarning,
        MigrationStage::DbMigrationExport,
        MigrationStage::DbMigrationExportWait,
        MigrationStage::DbMigrationUpload,
        MigrationStage::DbMigrationUploadWait,
        MigrationStage::DataMigrationImport,
        MigrationStage::DataMigrationImportWait,
        MigrationStage::Validate,
        MigrationStage::Cutover,
    ];
    for stage in path {
        orchestrator
            .transition(stage)
            .await
            .expect("Failed to advance migration");
        if stage == target {
            return;
        }
    }
}

fn to_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A provision request received by [`FakeStackApi`]
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub template_url: String,
    pub stack_name: String,
    pub params: StackParameters,
}

/// Stack API with scripted statuses
///
/// Each stack answers its scripted statuses in order and then repeats the
/// last one. Unscripted stacks stay `CREATE_IN_PROGRESS`.
#[derive(Default)]
pub struct FakeStackApi {
    statuses: Mutex<HashMap<String, VecDeque<InfrastructureDeploymentState>>>,
    root_causes: Mutex<HashMap<String, String>>,
    rejected: Mutex<HashSet<String>>,
    unreadable: Mutex<HashSet<String>>,
    outputs: Mutex<HashMap<String, HashMap<String, String>>>,
    parameters: Mutex<HashMap<String, HashMap<String, String>>>,
    resources: Mutex<HashMap<String, HashMap<String, String>>>,
    exports: Mutex<HashMap<String, String>>,
    provisioned: Mutex<Vec<ProvisionRequest>>,
    status_queries: AtomicUsize,
}

impl FakeStackApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, stack: &str, statuses: &[InfrastructureDeploymentState]) {
        self.statuses
            .lock()
            .unwrap()
            .insert(stack.to_string(), statuses.iter().copied().collect());
    }

    pub fn set_root_cause(&self, stack: &str, cause: &str) {
        self.root_causes
            .lock()
            .unwrap()
            .insert(stack.to_string(), cause.to_string());
    }

    pub fn reject_provisioning(&self, stack: &str) {
        self.rejected.lock().unwrap().insert(stack.to_string());
    }

    pub fn fail_status_queries(&self, stack: &str) {
        self.unreadable.lock().unwrap().insert(stack.to_string());
    }

    pub fn set_outputs(&self, stack: &str, outputs: &[(&str, &str)]) {
        self.outputs
            .lock()
            .unwrap()
            .insert(stack.to_string(), to_map(outputs));
    }

    pub fn set_parameters(&self, stack: &str, params: &[(&str, &str)]) {
        self.parameters
            .lock()
            .unwrap()
            .insert(stack.to_string(), to_map(params));
    }

    pub fn set_resources(&self, stack: &str, resources: &[(&str, &str)]) {
        self.resources
            .lock()
            .unwrap()
            .insert(stack.to_string(), to_map(resources));
    }

    pub fn set_exports(&self, exports: &[(&str, &str)]) {
        *self.exports.lock().unwrap() = to_map(exports);
    }

    pub fn provisioned(&self) -> Vec<ProvisionRequest> {
        self.provisioned.lock().unwrap().clone()
    }

    pub fn status_queries(&self) -> usize {
        self.status_queries.load(Ordering::SeqCst)
    }

    /// Application and helper stacks that both deploy on the first poll
    pub fn with_migration_fixture() -> Self {
        use InfrastructureDeploymentState::CreateComplete;

        let stacks = Self::new();
        stacks.script(APP_STACK, &[CreateComplete]);
        stacks.script(HELPER_STACK, &[CreateComplete]);
        stacks.set_outputs(
            APP_STACK,
            &[
                ("ServiceURL", "https://jira.example.com"),
                ("DBEndpointAddress", "jira-db.internal"),
                ("SGname", "sg-0app"),
            ],
        );
        stacks.set_parameters(APP_STACK, &[("ExportPrefix", "JIRA-")]);
        stacks.set_exports(&[
            ("JIRA-PriNets", "subnet-1,subnet-2"),
            ("JIRA-VPCID", "vpc-0main"),
        ]);
        stacks.set_resources(APP_STACK, &[("JiraDCStack", NESTED_STACK)]);
        stacks.set_resources(NESTED_STACK, &[("ElasticFileSystem", "fs-0shared")]);
        stacks.set_outputs(
            HELPER_STACK,
            &[
                ("DownloadSSMDocument", "jira-stack-migration-Download"),
                ("DownloadStatusSSMDocument", "jira-stack-migration-DownloadStatus"),
                ("RdsRestoreSSMDocument", DB_RESTORE_DOCUMENT),
                ("ServerGroup", "jira-stack-migration-asg"),
                ("MigrationBucket", MIGRATION_BUCKET),
            ],
        );
        stacks
    }
}

#[async_trait]
impl StackApi for FakeStackApi {
    async fn provision_stack(
        &self,
        template_url: &str,
        stack_name: &str,
        params: &StackParameters,
    ) -> Result<String> {
        if self.rejected.lock().unwrap().contains(stack_name) {
            return Err(Error::Provider(format!("stack {} already exists", stack_name)));
        }
        self.provisioned.lock().unwrap().push(ProvisionRequest {
            template_url: template_url.to_string(),
            stack_name: stack_name.to_string(),
            params: params.clone(),
        });
        Ok(format!("arn:aws:cloudformation:stack/{}", stack_name))
    }

    async fn get_status(&self, stack_name: &str) -> Result<InfrastructureDeploymentState> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        if self.unreadable.lock().unwrap().contains(stack_name) {
            return Err(Error::Provider("throttled".to_string()));
        }

        let mut statuses = self.statuses.lock().unwrap();
        let Some(script) = statuses.get_mut(stack_name) else {
            return Ok(InfrastructureDeploymentState::CreateInProgress);
        };
        let state = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        };
        Ok(state.unwrap_or(InfrastructureDeploymentState::CreateInProgress))
    }

    async fn get_stack_error_root_cause(&self, stack_name: &str) -> Result<Option<String>> {
        Ok(self.root_causes.lock().unwrap().get(stack_name).cloned())
    }

    async fn get_stack_outputs(&self, stack_name: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .outputs
            .lock()
            .unwrap()
            .get(stack_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_stack_parameters(&self, stack_name: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .parameters
            .lock()
            .unwrap()
            .get(stack_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_exports(&self) -> Result<HashMap<String, String>> {
        Ok(self.exports.lock().unwrap().clone())
    }

    async fn get_stack_resources(&self, stack_name: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .get(stack_name)
            .cloned()
            .unwrap_or_default())
    }
}

/// A document run received by [`FakeCommandApi`]
#[derive(Debug, Clone)]
pub struct DocumentRun {
    pub document: String,
    pub instance_id: String,
    pub params: CommandParameters,
    pub command_id: String,
}

/// Remote command API with scripted invocation results
///
/// Queries answer the scripted results in order and then repeat the last
/// one. Without a script every invocation is `Success` with no stderr.
/// Scripted stdout advances the same way, independently of the statuses.
#[derive(Default)]
pub struct FakeCommandApi {
    script: Mutex<VecDeque<(CommandStatus, Option<String>)>>,
    stdout: Mutex<VecDeque<String>>,
    rejected_documents: Mutex<HashSet<String>>,
    runs: Mutex<Vec<DocumentRun>>,
    queries: AtomicUsize,
    failing_queries: Mutex<bool>,
}

impl FakeCommandApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, results: &[(CommandStatus, Option<&str>)]) {
        *self.script.lock().unwrap() = results
            .iter()
            .map(|(status, stderr)| (*status, stderr.map(str::to_string)))
            .collect();
    }

    pub fn script_stdout(&self, outputs: &[&str]) {
        *self.stdout.lock().unwrap() = outputs.iter().map(|s| s.to_string()).collect();
    }

    pub fn reject_document(&self, document: &str) {
        self.rejected_documents
            .lock()
            .unwrap()
            .insert(document.to_string());
    }

    pub fn fail_queries(&self) {
        *self.failing_queries.lock().unwrap() = true;
    }

    pub fn runs(&self) -> Vec<DocumentRun> {
        self.runs.lock().unwrap().clone()
    }

    /// The shell commands sent, in order
    pub fn shell_commands(&self) -> Vec<String> {
        self.runs()
            .into_iter()
            .filter_map(|run| run.params.get("commands").cloned())
            .flatten()
            .collect()
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteCommandApi for FakeCommandApi {
    async fn run_document(
        &self,
        document: &str,
        instance_id: &str,
        params: &CommandParameters,
    ) -> Result<String> {
        if self.rejected_documents.lock().unwrap().contains(document) {
            return Err(Error::Provider(format!("document {} does not exist", document)));
        }
        let mut runs = self.runs.lock().unwrap();
        let command_id = format!("cmd-{}", runs.len() + 1);
        runs.push(DocumentRun {
            document: document.to_string(),
            instance_id: instance_id.to_string(),
            params: params.clone(),
            command_id: command_id.clone(),
        });
        Ok(command_id)
    }

    async fn get_command_invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<CommandInvocation> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if *self.failing_queries.lock().unwrap() {
            return Err(Error::Provider("invocation does not exist".to_string()));
        }

        let mut script = self.script.lock().unwrap();
        let (status, stderr) = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
        .unwrap_or((CommandStatus::Success, None));

        let mut outputs = self.stdout.lock().unwrap();
        let stdout = if outputs.len() > 1 {
            outputs.pop_front()
        } else {
            outputs.front().cloned()
        };

        Ok(CommandInvocation {
            command_id: command_id.to_string(),
            instance_id: instance_id.to_string(),
            status,
            stdout,
            stderr,
        })
    }

    fn output_key_prefix(&self) -> String {
        "trebuchet-ssm-document-logs".to_string()
    }
}

/// Instance locator with fixed answers
pub struct FakeLocator {
    pub stack_instance: Option<String>,
    pub group_instance: Option<String>,
}

impl FakeLocator {
    pub fn new() -> Self {
        Self {
            stack_instance: Some(APP_INSTANCE.to_string()),
            group_instance: Some(HELPER_INSTANCE.to_string()),
        }
    }

    pub fn empty() -> Self {
        Self {
            stack_instance: None,
            group_instance: None,
        }
    }
}

#[async_trait]
impl InstanceLocator for FakeLocator {
    async fn instance_for_stack(&self, _stack_name: &str) -> Result<Option<String>> {
        Ok(self.stack_instance.clone())
    }

    async fn instance_in_group(&self, _group_name: &str) -> Result<Option<String>> {
        Ok(self.group_instance.clone())
    }
}

/// Records every event it receives
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<MigrationEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<MigrationEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl MigrationEventListener for RecordingListener {
    fn on_event(&self, event: &MigrationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Records every unscheduled migration
#[derive(Default)]
pub struct RecordingCancellable {
    unscheduled: Mutex<Vec<MigrationId>>,
}

impl RecordingCancellable {
    pub fn unscheduled(&self) -> Vec<MigrationId> {
        self.unscheduled.lock().unwrap().clone()
    }
}

impl CancellableMigrationService for RecordingCancellable {
    fn unschedule_migration(&self, migration_id: MigrationId) {
        self.unscheduled.lock().unwrap().push(migration_id);
    }
}

/// Records terminal callbacks of a deployment
#[derive(Default)]
pub struct RecordingCallbacks {
    successes: AtomicUsize,
    failures: Mutex<Vec<String>>,
}

impl RecordingCallbacks {
    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeploymentCallbacks for RecordingCallbacks {
    async fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_failure(&self, reason: String) {
        self.failures.lock().unwrap().push(reason);
    }
}

/// Migration the watcher tests deploy for when no orchestrator is involved
pub const TEST_MIGRATION: MigrationId = MigrationId(1);

/// Records every polled status
#[derive(Default)]
pub struct RecordingStatusRecorder {
    states: Mutex<Vec<(MigrationId, InfrastructureDeploymentState)>>,
}

impl RecordingStatusRecorder {
    pub fn states(&self) -> Vec<InfrastructureDeploymentState> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .map(|(_, state)| *state)
            .collect()
    }

    pub fn migrations(&self) -> Vec<MigrationId> {
        self.states.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }
}

#[async_trait]
impl DeploymentStatusRecorder for RecordingStatusRecorder {
    async fn record_deployment_state(
        &self,
        migration_id: MigrationId,
        state: InfrastructureDeploymentState,
    ) -> Result<()> {
        self.states.lock().unwrap().push((migration_id, state));
        Ok(())
    }
}
