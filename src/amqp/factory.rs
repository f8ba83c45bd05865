use crate::configuration::{BackoffSettings, BrokerSettings};
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens connections to an AMQP broker, plain or TLS, bounded by the
/// configured connection timeout.
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_timeout: Duration,
    /// If `None`, connections are established in plain text.
    tls: Option<Arc<Tls>>,
}

struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl Tls {
    fn from_settings(settings: &BrokerSettings) -> Result<Option<Self>, anyhow::Error> {
        let Some(tls_settings) = settings.tls.as_ref() else {
            return Ok(None);
        };
        let domain_name = tls_settings
            .domain
            .clone()
            .unwrap_or_else(|| settings.uri.clone());
        let mut builder = NativeTlsConnector::builder();
        if let Some(certificate) = tls_settings.ca_certificate_chain()? {
            builder.add_root_certificate(certificate);
        }
        let connector = builder
            .build()
            .context("Failed to assemble the TLS connector for the AMQP broker.")?;
        Ok(Some(Self {
            connector,
            domain_name,
        }))
    }
}

impl ConnectionFactory {
    /// Assemble a factory from broker settings: the fully qualified AMQP URI
    /// (heartbeat included), the connection timeout, and the optional TLS
    /// connector with its expected certificate domain.
    pub fn new_from_config(settings: &BrokerSettings) -> Result<Self, anyhow::Error> {
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            tls: Tls::from_settings(settings)?.map(Arc::new),
        })
    }

    /// Open a single connection to the broker.
    #[tracing::instrument(name = "amqp_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connecting = async {
            match self.tls.as_ref() {
                None => lapin::Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => {
                    let tls = Arc::clone(tls);
                    lapin::Connection::connector(
                        self.uri.clone(),
                        Box::new(move |uri| {
                            // The TCP leg always speaks plain AMQP; TLS wraps
                            // it afterwards with the custom connector and the
                            // expected certificate domain.
                            let mut tcp_uri = uri.clone();
                            tcp_uri.scheme = AMQPScheme::AMQP;
                            tcp_uri.connect().and_then(|tcp| {
                                tcp.into_native_tls(&tls.connector, &tls.domain_name)
                            })
                        }),
                        properties,
                    )
                    .await
                }
            }
        };
        let connection = tokio::time::timeout(self.connection_timeout, connecting)
            .await
            .context("Timed out while connecting to the AMQP broker.")?
            .context("Failed to connect to the AMQP broker.")?;
        // Surface async connection breakage in the logs; the pools detect it
        // through the connection state on the next lease.
        connection.on_error(|e| {
            warn!("broken AMQP connection: {e:?}");
        });
        Ok(connection)
    }

    /// Open a connection, retrying transient failures under `schedule`.
    ///
    /// Every failed attempt is logged and retried after the schedule's next
    /// delay; the error only surfaces once its total budget is spent. This
    /// is the rebuild path the pools use for broken connection slots.
    pub async fn new_connection_with_backoff(
        &self,
        schedule: &BackoffSettings,
    ) -> Result<lapin::Connection, anyhow::Error> {
        backoff::future::retry(schedule.exponential(), || async {
            self.new_connection().await.map_err(|e| {
                debug!("connection attempt failed: {e:?}");
                backoff::Error::transient(e)
            })
        })
        .await
    }
}
