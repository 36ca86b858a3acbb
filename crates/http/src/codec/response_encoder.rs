use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::body::PayloadEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, PayloadSize, ResponseHead, SendError};

/// Encodes one response: its head, then body items until
/// [`PayloadItem::Eof`](crate::protocol::PayloadItem::Eof).
#[derive(Debug)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
    finished: bool,
}

impl ResponseEncoder {
    pub fn new(header_encoder: HeaderEncoder) -> Self {
        Self { header_encoder, payload_encoder: None, finished: false }
    }

    pub fn head_written(&self) -> bool {
        self.payload_encoder.is_some() || self.finished
    }

    pub fn is_finish(&self) -> bool {
        self.finished
    }
}

impl<D: Buf> Encoder<Message<(ResponseHead, PayloadSize), D>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(ResponseHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.finished {
            return Err(SendError::AlreadyEnded);
        }

        match item {
            Message::Header((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive response head");
                    return Err(SendError::HeadAlreadySent);
                }

                self.header_encoder.encode((head, payload_size), dst)?;
                self.payload_encoder = Some(payload_size.into());
                Ok(())
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    error!("expect response head but receive payload item");
                    return Err(SendError::HeadNotSent);
                };

                let result = payload_encoder.encode(payload_item, dst);
                if payload_encoder.is_finish() {
                    self.payload_encoder = None;
                    self.finished = true;
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PayloadItem, status_head};
    use bytes::Bytes;
    use http::{StatusCode, Version};

    #[test]
    fn head_then_body() {
        let mut encoder = ResponseEncoder::new(HeaderEncoder::new(Version::HTTP_11, true));
        let mut dst = BytesMut::new();

        let payload: Message<_, Bytes> = Message::Payload(PayloadItem::Eof);
        assert!(matches!(encoder.encode(payload, &mut dst), Err(SendError::HeadNotSent)));

        let head = Message::<_, Bytes>::Header((status_head(StatusCode::OK), PayloadSize::Length(2)));
        encoder.encode(head, &mut dst).unwrap();
        assert!(encoder.head_written());
        encoder.encode(Message::Payload(PayloadItem::Chunk(Bytes::from_static(b"ok"))), &mut dst).unwrap();
        encoder.encode(Message::<_, Bytes>::Payload(PayloadItem::Eof), &mut dst).unwrap();

        assert!(encoder.is_finish());
        assert!(dst.ends_with(b"\r\n\r\nok"));
    }
}
