//! Small shared helpers

use std::future::Future;
use std::time::Instant;
use tracing::debug;

/// Run a future and log how long it took at debug level
pub async fn measure<T, F>(label: &str, fut: F) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let result = fut.await;
    debug!("{} completed in {:?}", label, start.elapsed());
    result
}
