use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_postgres::config::{Host, SslMode as PgSslMode};
use tokio_postgres::NoTls;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Use with caution.
    /// Ignored for VerifyCa and VerifyFull.
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate file (PEM format).
    /// If not set, uses the system CA store.
    pub ca_cert_path: Option<String>,
    pub pool_size: usize,
    /// Server-side limit for every statement run through the pool.
    pub statement_timeout_secs: u64,
    /// Namespace whose tables are described to the model.
    pub introspect_schema: String,
    /// Namespace holding persisted query records.
    pub history_schema: String,
}

/// SSL/TLS connection modes for PostgreSQL.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl ConnectionConfig {
    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }

    /// Build a config from a `postgres://` URL or libpq key=value string.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed: tokio_postgres::Config = url.parse().context("Invalid connection string")?;
        let mut config = Self::default();

        if let Some(Host::Tcp(host)) = parsed.get_hosts().first() {
            config.host = host.clone();
        }
        if let Some(port) = parsed.get_ports().first() {
            config.port = *port;
        }
        if let Some(dbname) = parsed.get_dbname() {
            config.database = dbname.to_string();
        }
        if let Some(user) = parsed.get_user() {
            config.username = user.to_string();
        }
        if let Some(password) = parsed.get_password() {
            config.password = String::from_utf8_lossy(password).into_owned();
        }
        config.ssl_mode = match parsed.get_ssl_mode() {
            PgSslMode::Disable => SslMode::Disable,
            PgSslMode::Require => SslMode::Require,
            _ => SslMode::Prefer,
        };

        Ok(config)
    }

    fn pg_config(&self) -> tokio_postgres::Config {
        let ssl_mode = match self.ssl_mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Prefer => PgSslMode::Prefer,
            // Certificate checks for the verify modes happen in the TLS connector.
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => PgSslMode::Require,
        };

        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.username)
            .password(&self.password)
            .ssl_mode(ssl_mode)
            .application_name("nlsql")
            .connect_timeout(Duration::from_secs(10));

        if self.statement_timeout_secs > 0 {
            pg.options(&format!(
                "-c statement_timeout={}",
                self.statement_timeout_secs * 1000
            ));
        }

        pg
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            pool_size: 8,
            statement_timeout_secs: 30,
            introspect_schema: String::from("public"),
            history_schema: String::from("nlsql"),
        }
    }
}

/// Create a connection pool shared by introspection, execution and record
/// persistence. Connections are opened lazily on first use.
pub fn create_pool(config: &ConnectionConfig) -> Result<Pool> {
    let pg = config.pg_config();
    let manager_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let manager = match config.ssl_mode {
        SslMode::Disable => Manager::from_config(pg, NoTls, manager_config),
        SslMode::Prefer | SslMode::Require => {
            let tls = build_tls_connector(config, false)?;
            Manager::from_config(pg, tls, manager_config)
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            let tls = build_tls_connector(config, true)?;
            Manager::from_config(pg, tls, manager_config)
        }
    };

    let pool = Pool::builder(manager)
        .max_size(config.pool_size.max(1))
        .build()
        .context("Failed to build PostgreSQL connection pool")?;

    tracing::debug!(
        target = %config.display_string(),
        pool_size = config.pool_size,
        "connection pool ready"
    );

    Ok(pool)
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// # Arguments
/// * `config` - Connection configuration
/// * `strict_verify` - If true, always verify certificates (for verify-ca/verify-full modes)
fn build_tls_connector(config: &ConnectionConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else {
        if let Some(ca_path) = &config.ca_cert_path {
            let ca_data = std::fs::read(ca_path)
                .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
            for cert in split_pem_certificates(&ca_data)? {
                let cert = native_tls::Certificate::from_pem(cert.as_bytes())
                    .context("Failed to parse certificate")?;
                builder.add_root_certificate(cert);
            }
        }
        // VerifyCa checks the chain only.
        if strict_verify && config.ssl_mode == SslMode::VerifyCa {
            builder.danger_accept_invalid_hostnames(true);
        }
    }

    let connector = builder.build().context("Failed to build TLS connector")?;

    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into one PEM block per certificate.
fn split_pem_certificates(pem_data: &[u8]) -> Result<Vec<String>> {
    let pem_str =
        std::str::from_utf8(pem_data).context("CA certificate file is not valid UTF-8")?;

    let mut certs = Vec::new();
    let mut current_cert = String::new();
    let mut in_cert = false;

    for line in pem_str.lines() {
        if line.contains("-----BEGIN CERTIFICATE-----") {
            in_cert = true;
            current_cert.clear();
            current_cert.push_str(line.trim());
            current_cert.push('\n');
        } else if line.contains("-----END CERTIFICATE-----") {
            if in_cert {
                current_cert.push_str(line.trim());
                current_cert.push('\n');
                certs.push(std::mem::take(&mut current_cert));
            }
            in_cert = false;
        } else if in_cert {
            current_cert.push_str(line.trim());
            current_cert.push('\n');
        }
    }

    if certs.is_empty() {
        anyhow::bail!("No valid certificates found in PEM data");
    }

    Ok(certs)
}
