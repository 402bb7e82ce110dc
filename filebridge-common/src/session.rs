use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::Result;

/// Open a Zenoh session.
pub async fn connect(config: &ZenohConfig) -> Result<Session> {
    let zenoh_config = config.to_zenoh()?;

    tracing::debug!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Opening Zenoh session"
    );
    let session = zenoh::open(zenoh_config).await?;
    tracing::info!(zid = %session.zid(), mode = %config.mode, "Zenoh session open");

    Ok(session)
}
