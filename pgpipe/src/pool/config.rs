use super::Pool;
use crate::{Config, Result, connection::{self, Connector}};

const DEFAULT_MAX_CONNECTION: usize = 10;

/// Pool configuration builder.
pub struct PoolConfig {
    pub(crate) conn: Config,
    pub(crate) max_conn: usize,
    pub(crate) connect: Connector,
}

impl PoolConfig {
    /// Pool with connection config from environment variable.
    ///
    /// See [`Config::from_env`] for more details on env.
    pub fn from_env() -> PoolConfig {
        Self::new(Config::from_env())
    }

    pub fn new(conn: Config) -> PoolConfig {
        Self {
            conn,
            max_conn: DEFAULT_MAX_CONNECTION,
            connect: connection::connector(),
        }
    }

    /// Get connection config.
    pub fn connection(&self) -> &Config {
        &self.conn
    }

    /// Set max connection value.
    ///
    /// # Panics
    ///
    /// Panics if `value` is zero.
    pub fn max_connection(mut self, value: usize) -> Self {
        assert!(value > 0, "pool requires at least one connection");
        self.max_conn = value;
        self
    }

    #[cfg(test)]
    pub(crate) fn connector(mut self, connect: Connector) -> Self {
        self.connect = connect;
        self
    }
}

impl PoolConfig {
    pub async fn connect(mut self, url: &str) -> Result<Pool> {
        self.conn = Config::parse(url)?;
        Pool::connect_with(self).await
    }

    pub fn connect_lazy(mut self, url: &str) -> Result<Pool> {
        self.conn = Config::parse(url)?;
        Ok(Pool::connect_lazy_with(self))
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("conn", &self.conn)
            .field("max_conn", &self.max_conn)
            .finish()
    }
}
