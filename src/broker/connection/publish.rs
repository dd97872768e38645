//! PUBLISH and acknowledgement handling

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::{Connection, ConnectionError, Flow};
use crate::auth::AclAction;
use crate::message::Message;
use crate::protocol::{Packet, ProtocolError, PubAck, PubComp, PubRec, PubRel, Publish, QoS};
use crate::session::{Outbound, Session};
use crate::topic::{apply_mount_point, validate_topic_name};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Handle PUBLISH from the client
    ///
    /// QoS 2 is refused by closing the connection. A publish the client may
    /// not write is also fatal, since MQTT 3.1.1 has no negative PUBACK.
    pub(crate) async fn handle_publish(
        &mut self,
        session: &Arc<Session>,
        publish: Publish,
    ) -> Result<Flow, ConnectionError> {
        if publish.qos == QoS::ExactlyOnce {
            return Err(ProtocolError::UnsupportedQoS(2).into());
        }
        validate_topic_name(&publish.topic).map_err(ProtocolError::ProtocolViolation)?;

        let config = self.manager.config();
        let limit = config.mqtt.message_size_limit;
        if limit > 0 && publish.payload.len() > limit {
            return Err(ProtocolError::MessageTooLarge(publish.payload.len()).into());
        }

        let topic: Arc<str> = match apply_mount_point(&config.mqtt.mount_point, &publish.topic) {
            std::borrow::Cow::Borrowed(_) => publish.topic.clone(),
            std::borrow::Cow::Owned(mounted) => Arc::from(mounted),
        };

        if self
            .manager
            .auth()
            .check_acl(session.client_id(), session.username(), &topic, AclAction::Write)
            .is_err()
        {
            debug!("{}: not authorized to publish to '{}'", session.client_id(), topic);
            return Err(ProtocolError::NotAuthorized.into());
        }

        trace!(
            "{}: PUBLISH '{}' ({} bytes, qos {:?})",
            session.client_id(),
            topic,
            publish.payload.len(),
            publish.qos
        );

        let message = Message::from_publish(&publish, topic);
        self.manager.publish(session.client_id(), message).await;

        if publish.qos == QoS::AtLeastOnce {
            if let Some(packet_id) = publish.packet_id {
                session.send(Packet::PubAck(PubAck { packet_id })).await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// The client acknowledged one of our QoS 1 deliveries
    pub(crate) async fn handle_puback(
        &mut self,
        session: &Arc<Session>,
        puback: PubAck,
    ) -> Result<Flow, ConnectionError> {
        session.send_outbound(Outbound::Acked(puback.packet_id)).await?;
        Ok(Flow::Continue)
    }

    /// The broker never sends QoS 2, so there is nothing to release
    pub(crate) fn handle_pubrec(
        &mut self,
        session: &Arc<Session>,
        pubrec: PubRec,
    ) -> Result<Flow, ConnectionError> {
        debug!(
            "{}: ignoring PUBREC for packet {}",
            session.client_id(),
            pubrec.packet_id
        );
        Ok(Flow::Continue)
    }

    /// Complete the exchange so the client frees the packet id
    pub(crate) async fn handle_pubrel(
        &mut self,
        session: &Arc<Session>,
        pubrel: PubRel,
    ) -> Result<Flow, ConnectionError> {
        session
            .send(Packet::PubComp(PubComp {
                packet_id: pubrel.packet_id,
            }))
            .await?;
        Ok(Flow::Continue)
    }

    pub(crate) fn handle_pubcomp(
        &mut self,
        session: &Arc<Session>,
        pubcomp: PubComp,
    ) -> Result<Flow, ConnectionError> {
        debug!(
            "{}: ignoring PUBCOMP for packet {}",
            session.client_id(),
            pubcomp.packet_id
        );
        Ok(Flow::Continue)
    }
}
