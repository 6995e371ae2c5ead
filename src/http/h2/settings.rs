//! SETTINGS parameters.

use super::error::H2Error;
use bytes::{Buf, BufMut, BytesMut};

const HEADER_TABLE_SIZE: u16 = 0x1;
const ENABLE_PUSH: u16 = 0x2;
const MAX_CONCURRENT_STREAMS: u16 = 0x3;
const INITIAL_WINDOW_SIZE: u16 = 0x4;
const MAX_FRAME_SIZE: u16 = 0x5;
const MAX_HEADER_LIST_SIZE: u16 = 0x6;

pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// One endpoint's SETTINGS. Fields left `None` were never advertised and
/// keep their protocol default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// What this client advertises: no server push, larger receive windows.
    pub fn client(initial_window_size: u32) -> Self {
        Self {
            enable_push: false,
            initial_window_size: initial_window_size.min(MAX_WINDOW_SIZE),
            ..Default::default()
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        put_setting(dst, HEADER_TABLE_SIZE, self.header_table_size);
        put_setting(dst, ENABLE_PUSH, u32::from(self.enable_push));
        if let Some(v) = self.max_concurrent_streams {
            put_setting(dst, MAX_CONCURRENT_STREAMS, v);
        }
        put_setting(dst, INITIAL_WINDOW_SIZE, self.initial_window_size);
        put_setting(dst, MAX_FRAME_SIZE, self.max_frame_size);
        if let Some(v) = self.max_header_list_size {
            put_setting(dst, MAX_HEADER_LIST_SIZE, v);
        }
    }

    pub fn encoded_len(&self) -> usize {
        6 * (4
            + usize::from(self.max_concurrent_streams.is_some())
            + usize::from(self.max_header_list_size.is_some()))
    }

    /// Apply the parameters in `payload` on top of `self`.
    pub fn merge(&mut self, mut payload: &[u8]) -> Result<(), H2Error> {
        if payload.len() % 6 != 0 {
            return Err(H2Error::FrameSize);
        }
        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            match id {
                HEADER_TABLE_SIZE => self.header_table_size = value,
                ENABLE_PUSH => {
                    if value > 1 {
                        return Err(H2Error::Protocol("ENABLE_PUSH must be 0 or 1"));
                    }
                    self.enable_push = value == 1;
                }
                MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(H2Error::FlowControl);
                    }
                    self.initial_window_size = value;
                }
                MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=16_777_215).contains(&value) {
                        return Err(H2Error::Protocol("MAX_FRAME_SIZE out of range"));
                    }
                    self.max_frame_size = value;
                }
                MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
                // unknown identifiers are ignored
                _ => {}
            }
        }
        Ok(())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, H2Error> {
        let mut settings = Settings::default();
        settings.merge(payload)?;
        Ok(settings)
    }
}

fn put_setting(dst: &mut BytesMut, id: u16, value: u32) {
    dst.put_u16(id);
    dst.put_u32(value);
}
