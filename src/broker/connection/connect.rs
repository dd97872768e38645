//! CONNECT packet handling

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};

use super::{Connection, ConnectionError};
use crate::auth::{AuthError, AuthOptions};
use crate::message::Message;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, ProtocolError, QoS, Will,
};
use crate::session::{ConnectRequest, Connected};
use crate::topic::{apply_mount_point, validate_topic_name};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Read the first packet, which must be CONNECT
    pub(crate) async fn read_connect(&mut self) -> Result<Connect, ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    return match packet {
                        Packet::Connect(connect) => Ok(*connect),
                        _ => {
                            debug!("First packet from {} was not CONNECT", self.addr);
                            Err(ProtocolError::ProtocolViolation("first packet must be CONNECT").into())
                        }
                    };
                }
                Ok(None) => {}
                Err(e) if e.is_unacceptable_protocol() => {
                    debug!("Unacceptable protocol from {}: {}", self.addr, e);
                    return self.refuse(ConnectReturnCode::UnacceptableProtocolVersion).await;
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.reader.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
        }
    }

    /// Validate and authenticate CONNECT, then create or resume the session
    ///
    /// The accepted CONNACK is queued on the session's outbound channel
    /// ahead of anything else; refusals are written straight to the socket.
    pub(crate) async fn handle_connect(
        &mut self,
        connect: Connect,
    ) -> Result<Connected, ConnectionError> {
        let protocol_version = connect.protocol_version;
        self.decoder.set_protocol_version(protocol_version);
        self.encoder.set_protocol_version(protocol_version);
        let config = self.manager.config().clone();

        let mut client_id = connect.client_id;
        if config.mqtt.user_name_as_client_id {
            if let Some(username) = &connect.username {
                client_id = username.clone();
            }
        }

        if client_id.is_empty() {
            if !protocol_version.allows_empty_client_id()
                || !connect.clean_session
                || !config.mqtt.allow_zero_length_client_id
            {
                debug!(
                    "Rejecting empty client ID (clean_session={}) from {}",
                    connect.clean_session, self.addr
                );
                return self.refuse(ConnectReturnCode::IdentifierRejected).await;
            }
            client_id = format!("relaymq-{:x}", super::rand_id());
        }

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        if config.auth.enabled && !config.auth.allow_anonymous && connect.username.is_none() {
            debug!("Anonymous CONNECT from {} refused", self.addr);
            return self.refuse(ConnectReturnCode::NotAuthorized).await;
        }

        let options = AuthOptions {
            client_id: client_id.clone(),
            username: connect.username.clone(),
            password: connect.password,
            protocol_version,
        };
        match self.manager.auth().authenticate(&options).await {
            Ok(()) => {}
            Err(AuthError::Internal(e)) => {
                error!("Authentication error for {}: {}", client_id, e);
                return self.refuse(ConnectReturnCode::ServerUnavailable).await;
            }
            Err(e) => {
                debug!("Authentication failed for {}: {}", client_id, e);
                return self.refuse(ConnectReturnCode::NotAuthorized).await;
            }
        }

        let will = match connect.will {
            Some(will) => Some(self.will_message(&client_id, will)?),
            None => None,
        };

        let keep_alive = if connect.keep_alive == 0 {
            config.session.default_keep_alive
        } else {
            connect.keep_alive
        };

        let request = ConnectRequest {
            client_id: Arc::from(client_id.as_str()),
            protocol_version,
            clean_session: connect.clean_session,
            keep_alive,
            username: connect.username,
            will,
        };
        let connected = match self.manager.connect(request).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("Failed to open session for {}: {}", client_id, e);
                return self.refuse(ConnectReturnCode::ServerUnavailable).await;
            }
        };

        connected
            .session
            .send(Packet::ConnAck(ConnAck {
                session_present: connected.session_present,
                return_code: ConnectReturnCode::Accepted,
            }))
            .await?;

        info!(
            "{} connected from {} (session_present={})",
            client_id, self.addr, connected.session_present
        );
        Ok(connected)
    }

    /// Will message with the mount point applied; QoS 2 wills are sent at QoS 1
    fn will_message(&self, client_id: &str, will: Will) -> Result<Message, ConnectionError> {
        validate_topic_name(&will.topic).map_err(ProtocolError::ProtocolViolation)?;

        let qos = if will.qos == QoS::ExactlyOnce {
            debug!("{}: will QoS 2 downgraded to 1", client_id);
            QoS::AtLeastOnce
        } else {
            will.qos
        };
        let topic = apply_mount_point(&self.manager.config().mqtt.mount_point, &will.topic);
        Ok(Message::new(topic.as_ref(), will.payload, qos, will.retain))
    }

    /// Write a refusing CONNACK and fail with the same code
    pub(crate) async fn refuse<T>(&mut self, code: ConnectReturnCode) -> Result<T, ConnectionError> {
        if let Some(writer) = self.writer.as_mut() {
            let mut buf = BytesMut::new();
            self.encoder
                .encode(&Packet::ConnAck(ConnAck::refused(code)), &mut buf)
                .map_err(ProtocolError::from)?;
            writer.write_all(&buf).await?;
            writer.flush().await?;
        }
        Err(ConnectionError::Refused(code))
    }
}
