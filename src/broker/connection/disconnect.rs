//! DISCONNECT handling and connection teardown

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Connection, ConnectionError, Flow};
use crate::session::Session;

/// How long the send worker may take to flush after the session closed
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Handle DISCONNECT from the client
    ///
    /// A clean DISCONNECT discards the will.
    pub(crate) fn handle_disconnect(
        &mut self,
        session: &Arc<Session>,
    ) -> Result<Flow, ConnectionError> {
        debug!("DISCONNECT from {}", session.client_id());
        if session.take_will().is_some() {
            debug!("{}: will discarded", session.client_id());
        }
        Ok(Flow::Disconnect)
    }

    /// Run the disconnect routine and wait for the send worker to finish
    pub(crate) async fn close(
        &mut self,
        session: &Arc<Session>,
        mut sender: JoinHandle<()>,
        graceful: bool,
    ) {
        self.manager.disconnect(session, graceful).await;

        if tokio::time::timeout(SENDER_DRAIN_TIMEOUT, &mut sender)
            .await
            .is_err()
        {
            debug!("{}: send worker did not drain in time", session.client_id());
            sender.abort();
        }
        debug!("Connection from {} closed", self.addr);
    }
}
