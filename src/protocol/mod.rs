//! Protocol definitions for radar device communication.
//!
//! This module contains the low-level protocol types including:
//! - Frame encoding/decoding with byte stuffing
//! - Command groups and their payload layout

pub mod frame;
pub mod group;

pub use frame::{
    FRAME_ESC, FRAME_START, FRAME_STOP, FrameDecoder, decode as decode_frame, encode as encode_frame,
};
pub use group::{CommandGroup, GroupId, command_label, decode_response, encode_for_transmission};
