//! Runtime-agnostic utility functions
//!
//! Helpers that hide the cfg-flag selection of the active runtime's timer.

use std::time::Duration;

/// Sleep for the specified duration using the current runtime
///
/// smol's timer is used whenever the `smol` feature is on, tokio's only when
/// it is the sole runtime feature.
pub async fn sleep(duration: Duration) {
    #[cfg(feature = "smol")]
    {
        smol::Timer::after(duration).await;
    }

    #[cfg(all(feature = "tokio", not(feature = "smol")))]
    {
        tokio::time::sleep(duration).await;
    }

    #[cfg(not(any(feature = "smol", feature = "tokio")))]
    {
        compile_error!("One of the runtime features must be enabled: smol or tokio");
    }
}
