//! # Schema Registry
//!
//! Typed payload serialization without reflection: the application
//! implements [`Payload`] for each of its message structs and registers it
//! under a small numeric type id. Encoded messages are self-describing — a
//! variable-int type id followed by the payload bits — so one channel can
//! carry a mix of registered types.

use std::any::Any;
use std::collections::HashMap;

use crate::buffer::BitBuffer;
use crate::error::{CourierError, Result};

/// A value that knows how to write and read itself through a [`BitBuffer`].
///
/// `write` and `read` must agree on field order; emitting fields in name
/// order matches payloads produced by name-sorting serializers.
pub trait Payload: Any {
    fn write(&self, buffer: &mut BitBuffer);
    fn read(buffer: &mut BitBuffer) -> Result<Self>
    where
        Self: Sized;
}

type Encoder = Box<dyn Fn(&dyn Any, &mut BitBuffer) -> Result<()>>;
type Decoder = Box<dyn Fn(&mut BitBuffer) -> Result<Box<dyn Any>>>;

/// Maps type ids to encode/decode pairs.
#[derive(Default)]
pub struct SchemaRegistry {
    entries: HashMap<u32, (Encoder, Decoder)>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `type_id`. Re-registering an id replaces it.
    pub fn register<T: Payload>(&mut self, type_id: u32) {
        let encoder: Encoder = Box::new(|value, buffer| {
            let value = value
                .downcast_ref::<T>()
                .ok_or(CourierError::Malformed("value does not match registered type"))?;
            value.write(buffer);
            Ok(())
        });
        let decoder: Decoder = Box::new(|buffer| Ok(Box::new(T::read(buffer)?) as Box<dyn Any>));
        self.entries.insert(type_id, (encoder, decoder));
    }

    pub fn is_registered(&self, type_id: u32) -> bool {
        self.entries.contains_key(&type_id)
    }

    /// Encode `value` with its type-id prefix into a fresh buffer.
    pub fn encode(&self, type_id: u32, value: &dyn Any) -> Result<BitBuffer> {
        let (encoder, _) = self
            .entries
            .get(&type_id)
            .ok_or(CourierError::Malformed("unregistered type id"))?;
        let mut buffer = BitBuffer::new();
        buffer.write_var_u32(type_id);
        encoder(value, &mut buffer)?;
        Ok(buffer)
    }

    /// Decode a prefixed payload; returns the type id and the boxed value.
    pub fn decode(&self, buffer: &mut BitBuffer) -> Result<(u32, Box<dyn Any>)> {
        let type_id = buffer.read_var_u32()?;
        let (_, decoder) = self
            .entries
            .get(&type_id)
            .ok_or(CourierError::Malformed("unregistered type id"))?;
        Ok((type_id, decoder(buffer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct PlayerState {
        id: u32,
        x: f32,
        y: f32,
        alive: bool,
    }

    impl Payload for PlayerState {
        fn write(&self, buffer: &mut BitBuffer) {
            buffer.write_bool(self.alive);
            buffer.write_var_u32(self.id);
            buffer.write_f32(self.x);
            buffer.write_f32(self.y);
        }

        fn read(buffer: &mut BitBuffer) -> Result<Self> {
            Ok(PlayerState {
                alive: buffer.read_bool()?,
                id: buffer.read_var_u32()?,
                x: buffer.read_f32()?,
                y: buffer.read_f32()?,
            })
        }
    }

    #[derive(Debug, PartialEq)]
    struct Chat {
        text: String,
    }

    impl Payload for Chat {
        fn write(&self, buffer: &mut BitBuffer) {
            buffer.write_string(&self.text);
        }

        fn read(buffer: &mut BitBuffer) -> Result<Self> {
            Ok(Chat {
                text: buffer.read_string()?,
            })
        }
    }

    #[test]
    fn encode_decode_dispatches_on_type_id() {
        let mut registry = SchemaRegistry::new();
        registry.register::<PlayerState>(1);
        registry.register::<Chat>(2);

        let state = PlayerState {
            id: 42,
            x: 1.5,
            y: -3.25,
            alive: true,
        };
        let mut encoded = registry.encode(1, &state).unwrap();
        let (type_id, value) = registry.decode(&mut encoded).unwrap();
        assert_eq!(type_id, 1);
        assert_eq!(*value.downcast::<PlayerState>().unwrap(), state);

        let chat = Chat {
            text: "gg".into(),
        };
        let mut encoded = registry.encode(2, &chat).unwrap();
        let (type_id, value) = registry.decode(&mut encoded).unwrap();
        assert_eq!(type_id, 2);
        assert_eq!(*value.downcast::<Chat>().unwrap(), chat);
    }

    #[test]
    fn unregistered_id_rejected() {
        let registry = SchemaRegistry::new();
        assert!(registry.encode(9, &Chat { text: String::new() }).is_err());

        let mut buffer = BitBuffer::new();
        buffer.write_var_u32(9);
        let mut registry = SchemaRegistry::new();
        registry.register::<Chat>(2);
        assert!(registry.decode(&mut buffer).is_err());
    }

    #[test]
    fn mismatched_value_type_rejected() {
        let mut registry = SchemaRegistry::new();
        registry.register::<Chat>(2);
        let state = PlayerState {
            id: 0,
            x: 0.0,
            y: 0.0,
            alive: false,
        };
        assert!(registry.encode(2, &state).is_err());
    }
}
