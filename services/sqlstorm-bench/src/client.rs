//! Database-client capability and its MySQL implementation.
//!
//! The engine only depends on [`DatabaseClient`] / [`ClientSession`];
//! the concrete backend is selected once at startup. Every session is
//! used for exactly one attempt and never reused.

use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder};
use tracing::debug;

use sqlstorm_core::classify::extract_errno;
use sqlstorm_core::config::{BenchConfig, SqlTimeoutMode};
use sqlstorm_core::ClientError;

/// One live connection, good for a single attempt.
#[async_trait]
pub trait ClientSession: Send {
    /// Runs the benchmark statement under the configured execution-limit
    /// policy.
    async fn execute(&mut self, sql: &str) -> Result<(), ClientError>;

    /// Clean teardown. Errors during teardown are ignored.
    async fn close(self: Box<Self>);
}

/// A backend capable of opening sessions against the target.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Short backend name for the banner and the failure log.
    fn label(&self) -> &'static str;

    /// Opens a fresh connection, bounded by the connect timeout.
    async fn connect(&self) -> Result<Box<dyn ClientSession>, ClientError>;
}

/// MySQL backend over `mysql_async`.
pub struct MySqlClient {
    host: String,
    port: u16,
    user: String,
    password: String,
    dbname: Option<String>,
    connect_timeout: Duration,
    sql_exec_timeout: Duration,
    sql_timeout_mode: SqlTimeoutMode,
}

impl MySqlClient {
    #[must_use]
    pub fn new(cfg: &BenchConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            dbname: cfg.dbname.clone(),
            connect_timeout: cfg.connect_timeout,
            sql_exec_timeout: cfg.sql_exec_timeout,
            sql_timeout_mode: cfg.sql_timeout_mode,
        }
    }

    fn opts(&self) -> OptsBuilder {
        OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.dbname.clone())
    }
}

#[async_trait]
impl DatabaseClient for MySqlClient {
    fn label(&self) -> &'static str {
        "mysql_async"
    }

    async fn connect(&self) -> Result<Box<dyn ClientSession>, ClientError> {
        let connect = Conn::new(self.opts());
        let mut conn = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => return Err(map_mysql_error(&err)),
            Err(_) => {
                // 2002 is the client-side "can't connect" code.
                return Err(ClientError::new(
                    2002,
                    format!(
                        "connect timed out after {:.3}s",
                        self.connect_timeout.as_secs_f64()
                    ),
                ))
            }
        };
        // The server-side execution limit is installed per session, so a
        // fresh connection must re-apply it before the first query. A
        // server that rejects it (old version, missing privilege) leaves
        // the session usable without the limit.
        if self.sql_timeout_mode == SqlTimeoutMode::Server && !self.sql_exec_timeout.is_zero() {
            let millis = self.sql_exec_timeout.as_millis();
            let stmt = format!("SET SESSION MAX_EXECUTION_TIME={millis}");
            if let Err(err) = conn.query_drop(stmt).await {
                debug!("could not set server execution limit: {err}");
            }
        }
        Ok(Box::new(MySqlSession {
            conn: Some(conn),
            sql_exec_timeout: self.sql_exec_timeout,
            sql_timeout_mode: self.sql_timeout_mode,
        }))
    }
}

struct MySqlSession {
    conn: Option<Conn>,
    sql_exec_timeout: Duration,
    sql_timeout_mode: SqlTimeoutMode,
}

#[async_trait]
impl ClientSession for MySqlSession {
    async fn execute(&mut self, sql: &str) -> Result<(), ClientError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(ClientError::new(0, "session already closed".to_string()));
        };
        let client_deadline = (self.sql_timeout_mode == SqlTimeoutMode::Client
            && !self.sql_exec_timeout.is_zero())
        .then_some(self.sql_exec_timeout);
        match client_deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, conn.query_drop(sql)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(map_mysql_error(&err)),
                    Err(_) => {
                        // The connection is in an indeterminate state after an
                        // abandoned wait; drop it instead of disconnecting.
                        self.conn = None;
                        Err(ClientError::new(
                            0,
                            format!("query timed out after {:.3}s", deadline.as_secs_f64()),
                        ))
                    }
                }
            }
            None => conn.query_drop(sql).await.map_err(|err| map_mysql_error(&err)),
        }
    }

    async fn close(mut self: Box<Self>) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.disconnect().await;
        }
    }
}

fn map_mysql_error(err: &mysql_async::Error) -> ClientError {
    match err {
        mysql_async::Error::Server(server) => {
            ClientError::new(u32::from(server.code), server.message.clone())
        }
        other => {
            let message = other.to_string();
            ClientError::new(extract_errno(&message), message)
        }
    }
}

/// Deterministic in-process backend for engine and worker tests. Each
/// script entry is one connect outcome; a successful connect carries the
/// query outcome its session will produce. When the script runs out the
/// client flips the shared stop flag, giving tests a natural-completion
/// path without a real server.
#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use sqlstorm_core::ClientError;

    use super::{ClientSession, DatabaseClient};
    use crate::engine::RunState;

    pub type ConnectOutcome = Result<Result<(), ClientError>, ClientError>;

    pub struct ScriptedClient {
        script: Mutex<VecDeque<ConnectOutcome>>,
        run: Arc<RunState>,
        stop_after_connect: bool,
    }

    impl ScriptedClient {
        pub fn new(script: Vec<ConnectOutcome>, run: Arc<RunState>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                run,
                stop_after_connect: false,
            }
        }

        /// A client whose single connect succeeds while flipping the stop
        /// flag, modeling shutdown racing a mid-flight request.
        pub fn stopping_after_connect(run: Arc<RunState>) -> Self {
            Self {
                script: Mutex::new(VecDeque::from(vec![Ok(Ok(()))])),
                run,
                stop_after_connect: true,
            }
        }

        fn next(&self) -> Option<ConnectOutcome> {
            let mut script = self.script.lock().unwrap();
            let outcome = script.pop_front();
            if script.is_empty() {
                self.run.request_stop();
            }
            outcome
        }
    }

    #[async_trait]
    impl DatabaseClient for ScriptedClient {
        fn label(&self) -> &'static str {
            "scripted"
        }

        async fn connect(&self) -> Result<Box<dyn ClientSession>, ClientError> {
            let outcome = self
                .next()
                .unwrap_or_else(|| Err(ClientError::new(0, "script exhausted".to_string())));
            if self.stop_after_connect {
                self.run.request_stop();
            }
            let query_outcome = outcome?;
            Ok(Box::new(ScriptedSession {
                outcome: Some(query_outcome),
            }))
        }
    }

    struct ScriptedSession {
        outcome: Option<Result<(), ClientError>>,
    }

    #[async_trait]
    impl ClientSession for ScriptedSession {
        async fn execute(&mut self, _sql: &str) -> Result<(), ClientError> {
            self.outcome
                .take()
                .unwrap_or_else(|| Err(ClientError::new(0, "session already used".to_string())))
        }

        async fn close(self: Box<Self>) {}
    }
}
