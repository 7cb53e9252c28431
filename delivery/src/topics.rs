//! Decoder for the topic list carried in Apple push certificate extensions.
//!
//! The blob is a flat run of sibling elements. A container header (`0x30 len`) is skipped
//! without tracking its bounds, a string header (`0x0C len`) is followed by `len` bytes
//! that make up one topic.

const CONTAINER_TAG: u8 = 0x30;
const STRING_TAG: u8 = 0x0C;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TopicError {
    #[error("topic: unknown block ID {0:#04x}")]
    UnknownBlock(u8),
}

enum State {
    NextBlock,
    ReadBlockSize,
    ReadValueSize,
    ReadValue { remaining: usize },
}

/// Returns every topic in `src`, in order and with duplicates kept.
///
/// A value cut short by the end of input is dropped.
pub fn extract_topics(src: &[u8]) -> Result<Vec<String>, TopicError> {
    let mut topics = Vec::new();
    let mut value = Vec::new();
    let mut state = State::NextBlock;

    for &byte in src {
        state = match state {
            State::NextBlock => match byte {
                CONTAINER_TAG => State::ReadBlockSize,
                STRING_TAG => State::ReadValueSize,
                other => return Err(TopicError::UnknownBlock(other)),
            },
            State::ReadBlockSize => State::NextBlock,
            State::ReadValueSize if byte == 0 => {
                topics.push(String::new());
                State::NextBlock
            }
            State::ReadValueSize => State::ReadValue {
                remaining: byte as usize,
            },
            State::ReadValue { remaining } => {
                value.push(byte);
                if remaining == 1 {
                    topics.push(String::from_utf8_lossy(&value).into_owned());
                    value.clear();
                    State::NextBlock
                } else {
                    State::ReadValue {
                        remaining: remaining - 1,
                    }
                }
            }
        };
    }

    Ok(topics)
}
