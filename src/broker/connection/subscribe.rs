//! SUBSCRIBE and UNSUBSCRIBE handling

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{Connection, ConnectionError, Flow};
use crate::auth::AclAction;
use crate::protocol::{
    Packet, ProtocolError, QoS, SubAck, Subscribe, SubscribeReturnCode, UnsubAck, Unsubscribe,
};
use crate::session::{Outbound, Session};
use crate::topic::{apply_mount_point, validate_topic_filter};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Handle SUBSCRIBE
    ///
    /// Each filter is granted or refused on its own. QoS 2 requests are
    /// granted at QoS 1. Retained messages follow the SUBACK through the
    /// same outbound channel, so the client sees the acknowledgement first.
    pub(crate) async fn handle_subscribe(
        &mut self,
        session: &Arc<Session>,
        subscribe: Subscribe,
    ) -> Result<Flow, ConnectionError> {
        let client_id = session.client_id();
        let mount_point = self.manager.config().mqtt.mount_point.clone();
        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut retained = Vec::new();

        for sub in &subscribe.subscriptions {
            let Some(requested) = QoS::from_u8(sub.qos) else {
                debug!("{}: invalid QoS {} for '{}'", client_id, sub.qos, sub.filter);
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            };
            if let Err(e) = validate_topic_filter(&sub.filter) {
                debug!("{}: invalid filter '{}': {}", client_id, sub.filter, e);
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let filter = apply_mount_point(&mount_point, &sub.filter);
            if self
                .manager
                .auth()
                .check_acl(client_id, session.username(), &filter, AclAction::Read)
                .is_err()
            {
                debug!("{}: not authorized to subscribe to '{}'", client_id, filter);
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let granted = requested.min(QoS::AtLeastOnce);
            match self.manager.subscribe(session, &filter, granted).await {
                Ok(messages) => {
                    debug!("{}: subscribed to '{}' (qos {:?})", client_id, filter, granted);
                    return_codes.push(SubscribeReturnCode::Granted(granted));
                    retained.extend(messages);
                }
                Err(e) => {
                    warn!("{}: failed to subscribe to '{}': {}", client_id, filter, e);
                    return_codes.push(SubscribeReturnCode::Failure);
                }
            }
        }

        session
            .send(Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                return_codes,
            }))
            .await?;

        for message in retained {
            if let Err(e) = session.send_outbound(Outbound::Deliver(message)).await {
                debug!("{}: dropping retained message: {}", client_id, e);
                break;
            }
        }
        Ok(Flow::Continue)
    }

    /// Handle UNSUBSCRIBE
    ///
    /// An invalid filter is a protocol violation because UNSUBACK carries
    /// no per-filter result.
    pub(crate) async fn handle_unsubscribe(
        &mut self,
        session: &Arc<Session>,
        unsubscribe: Unsubscribe,
    ) -> Result<Flow, ConnectionError> {
        let mount_point = self.manager.config().mqtt.mount_point.clone();

        for filter in &unsubscribe.filters {
            validate_topic_filter(filter).map_err(ProtocolError::ProtocolViolation)?;
            let filter = apply_mount_point(&mount_point, filter);
            let removed = self.manager.unsubscribe(session, &filter).await?;
            debug!(
                "{}: unsubscribed from '{}' (existed={})",
                session.client_id(),
                filter,
                removed
            );
        }

        session
            .send(Packet::UnsubAck(UnsubAck {
                packet_id: unsubscribe.packet_id,
            }))
            .await?;
        Ok(Flow::Continue)
    }
}
