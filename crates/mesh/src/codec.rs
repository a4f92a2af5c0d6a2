//! Length-prefixed postcard framing.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of
//! postcard. Frames above the configured limit are refused in both
//! directions.

use crate::error::MeshError;
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

const LENGTH_PREFIX: usize = 4;

/// Codec for one message type `T`.
#[derive(Debug)]
pub struct FrameCodec<T> {
    max_size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FrameCodec<T> {
    /// Codec accepting frames up to `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for FrameCodec<T> {
    fn clone(&self) -> Self {
        Self::new(self.max_size)
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = MeshError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX]);
        let frame_len = u32::from_be_bytes(prefix) as usize;
        if frame_len > self.max_size {
            return Err(MeshError::FrameTooLarge {
                len: frame_len,
                max: self.max_size,
            });
        }
        if src.len() < LENGTH_PREFIX + frame_len {
            src.reserve(LENGTH_PREFIX + frame_len - src.len());
            return Ok(None);
        }

        let message = postcard::from_bytes(&src[LENGTH_PREFIX..LENGTH_PREFIX + frame_len])?;
        src.advance(LENGTH_PREFIX + frame_len);
        Ok(Some(message))
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = MeshError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = postcard::to_stdvec(&item)?;
        if body.len() > self.max_size {
            return Err(MeshError::FrameTooLarge {
                len: body.len(),
                max: self.max_size,
            });
        }
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
