// Zenoh telemetry: rover snapshot and runtime health

use tracing::info;
use zenoh::Session;
use zenoh::pubsub::Publisher;

use crate::config::{TOPIC_HEALTH, TOPIC_STATUS};
use crate::messages::{RoverStatus, RuntimeHealth};

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub struct Telemetry {
    _session: Session,
    pub_status: Publisher<'static>,
    pub_health: Publisher<'static>,
}

impl Telemetry {
    pub async fn open() -> Result<Self> {
        info!("Opening Zenoh session...");
        let session = zenoh::open(zenoh::Config::default()).await?;
        let pub_status = session.declare_publisher(TOPIC_STATUS).await?;
        let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;
        info!("Publishing to: {}, {}", TOPIC_STATUS, TOPIC_HEALTH);
        Ok(Self {
            _session: session,
            pub_status,
            pub_health,
        })
    }

    pub async fn publish_status(&self, status: &RoverStatus) -> Result<()> {
        let json = serde_json::to_string(status)?;
        self.pub_status.put(json).await?;
        Ok(())
    }

    pub async fn publish_health(&self, health: RuntimeHealth) -> Result<()> {
        let json = serde_json::to_string(&health)?;
        self.pub_health.put(json).await?;
        Ok(())
    }
}
