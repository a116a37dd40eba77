//! Binary message encoding
//!
//! Layout: one kind byte followed by the variant's fields, all integers
//! little-endian and fixed width.
//!
//! | Kind | Fields |
//! |------|--------|
//! | 0 TopicData | topic u64, len u32, data |
//! | 1 TopicControl | topic u64, paused u8 |
//! | 2 Addressed | address u64, port u64, len u32, data |
//! | 3 AddressesChanged | add: count u32 + (id u64, cost u32)*, remove: count u32 + id u64* |
//! | 4 InTopicsChanged | add: count u32 + id u64*, remove: count u32 + id u64* |
//! | 5 OutTopicsChanged | same as AddressesChanged |
//!
//! Decoding rejects unknown kinds, truncated fields and trailing bytes.

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mesh_types::{Message, MessageKind, PricedId};

use crate::error::{ProtocolError, Result};

const ID_SIZE: usize = 8;
const COUNT_SIZE: usize = 4;
const PRICED_ID_SIZE: usize = 12;

/// Encode a message into a standalone buffer
pub fn encode_message(message: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(encoded_len(message));
    buf.put_u8(message.kind().into());

    match message {
        Message::TopicData { topic, data } => {
            buf.put_u64_le(*topic);
            put_payload(&mut buf, data)?;
        }
        Message::TopicControl { topic, paused } => {
            buf.put_u64_le(*topic);
            buf.put_u8(u8::from(*paused));
        }
        Message::Addressed {
            address,
            port,
            data,
        } => {
            buf.put_u64_le(*address);
            buf.put_u64_le(*port);
            put_payload(&mut buf, data)?;
        }
        Message::AddressesChanged { add, remove } | Message::OutTopicsChanged { add, remove } => {
            put_priced_ids(&mut buf, add)?;
            put_ids(&mut buf, remove)?;
        }
        Message::InTopicsChanged { add, remove } => {
            put_ids(&mut buf, add)?;
            put_ids(&mut buf, remove)?;
        }
    }

    Ok(buf.freeze())
}

/// Decode exactly one message from `data`
pub fn decode_message(data: &[u8]) -> Result<Message> {
    let mut buf = data;
    if !buf.has_remaining() {
        return Err(ProtocolError::message_too_small(1, 0, "message kind"));
    }

    let raw_kind = buf.get_u8();
    let kind = MessageKind::try_from(raw_kind)
        .map_err(|_| ProtocolError::UnknownMessageKind { kind: raw_kind })?;

    let message = match kind {
        MessageKind::TopicData => {
            let topic = get_u64(&mut buf, "topic")?;
            let data = get_payload(&mut buf)?;
            Message::TopicData { topic, data }
        }
        MessageKind::TopicControl => {
            let topic = get_u64(&mut buf, "topic")?;
            ensure_remaining(&buf, 1, "paused flag")?;
            let paused = match buf.get_u8() {
                0 => false,
                1 => true,
                other => {
                    return Err(ProtocolError::invalid_field(
                        "paused",
                        format!("expected 0 or 1, got {other}"),
                    ))
                }
            };
            Message::TopicControl { topic, paused }
        }
        MessageKind::Addressed => {
            let address = get_u64(&mut buf, "address")?;
            let port = get_u64(&mut buf, "port")?;
            let data = get_payload(&mut buf)?;
            Message::Addressed {
                address,
                port,
                data,
            }
        }
        MessageKind::AddressesChanged => Message::AddressesChanged {
            add: get_priced_ids(&mut buf)?,
            remove: get_ids(&mut buf)?,
        },
        MessageKind::InTopicsChanged => Message::InTopicsChanged {
            add: get_ids(&mut buf)?,
            remove: get_ids(&mut buf)?,
        },
        MessageKind::OutTopicsChanged => Message::OutTopicsChanged {
            add: get_priced_ids(&mut buf)?,
            remove: get_ids(&mut buf)?,
        },
    };

    if buf.has_remaining() {
        return Err(ProtocolError::TrailingBytes {
            remaining: buf.remaining(),
        });
    }

    Ok(message)
}

/// Exact encoded size of `message`
pub fn encoded_len(message: &Message) -> usize {
    1 + match message {
        Message::TopicData { data, .. } => ID_SIZE + COUNT_SIZE + data.len(),
        Message::TopicControl { .. } => ID_SIZE + 1,
        Message::Addressed { data, .. } => 2 * ID_SIZE + COUNT_SIZE + data.len(),
        Message::AddressesChanged { add, remove } | Message::OutTopicsChanged { add, remove } => {
            2 * COUNT_SIZE + add.len() * PRICED_ID_SIZE + remove.len() * ID_SIZE
        }
        Message::InTopicsChanged { add, remove } => {
            2 * COUNT_SIZE + (add.len() + remove.len()) * ID_SIZE
        }
    }
}

fn length_prefix(len: usize, field: &'static str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| ProtocolError::invalid_field(field, format!("{len} exceeds u32 length prefix")))
}

fn put_payload(buf: &mut BytesMut, data: &Bytes) -> Result<()> {
    buf.put_u32_le(length_prefix(data.len(), "data")?);
    buf.put_slice(data);
    Ok(())
}

fn put_ids(buf: &mut BytesMut, ids: &BTreeSet<u64>) -> Result<()> {
    buf.put_u32_le(length_prefix(ids.len(), "id set")?);
    for id in ids {
        buf.put_u64_le(*id);
    }
    Ok(())
}

fn put_priced_ids(buf: &mut BytesMut, ids: &BTreeSet<PricedId>) -> Result<()> {
    buf.put_u32_le(length_prefix(ids.len(), "priced id set")?);
    for priced in ids {
        buf.put_u64_le(priced.id);
        buf.put_u32_le(priced.cost);
    }
    Ok(())
}

fn ensure_remaining(buf: &&[u8], need: usize, context: &str) -> Result<()> {
    if buf.remaining() < need {
        return Err(ProtocolError::message_too_small(
            need,
            buf.remaining(),
            context,
        ));
    }
    Ok(())
}

fn get_u64(buf: &mut &[u8], context: &str) -> Result<u64> {
    ensure_remaining(buf, ID_SIZE, context)?;
    Ok(buf.get_u64_le())
}

fn get_count(buf: &mut &[u8], context: &str) -> Result<usize> {
    ensure_remaining(buf, COUNT_SIZE, context)?;
    Ok(buf.get_u32_le() as usize)
}

fn get_payload(buf: &mut &[u8]) -> Result<Bytes> {
    let len = get_count(buf, "payload length")?;
    ensure_remaining(buf, len, "payload")?;
    Ok(buf.copy_to_bytes(len))
}

fn get_ids(buf: &mut &[u8]) -> Result<BTreeSet<u64>> {
    let count = get_count(buf, "id count")?;
    ensure_remaining(buf, count.saturating_mul(ID_SIZE), "id set")?;
    Ok((0..count).map(|_| buf.get_u64_le()).collect())
}

fn get_priced_ids(buf: &mut &[u8]) -> Result<BTreeSet<PricedId>> {
    let count = get_count(buf, "priced id count")?;
    ensure_remaining(buf, count.saturating_mul(PRICED_ID_SIZE), "priced id set")?;
    Ok((0..count)
        .map(|_| {
            let id = buf.get_u64_le();
            let cost = buf.get_u32_le();
            PricedId::new(id, cost)
        })
        .collect())
}
