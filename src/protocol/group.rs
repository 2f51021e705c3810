//! Command groups: parameters that share one wire command.
//!
//! A request payload is the group's command bytes followed by the members'
//! values in order. A response repeats the command bytes and carries the
//! members' values in the same layout:
//! ```text
//! ┌───────────┬──────────┬──────────┬─────┬──────────────────┐
//! │  command  │ member 0 │ member 1 │ ... │ variable member? │
//! └───────────┴──────────┴──────────┴─────┴──────────────────┘
//! ```
//! Every member of a group updates, or none does.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::{DeviceModule, Direction, ParamId, ParamStatus, PayloadSize};

/// Index of a command group inside its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub usize);

/// Parameters encoded and decoded together under one command.
#[derive(Debug, Clone)]
pub struct CommandGroup {
    /// Index of this group.
    pub id: GroupId,
    /// Command bytes that start every request and response.
    pub command: Bytes,
    /// Members ordered by their order index.
    pub members: Vec<ParamId>,
    /// Direction shared by every member.
    pub direction: Direction,
}

impl CommandGroup {
    /// The first member, which identifies the group in queues.
    #[must_use]
    pub fn leader(&self) -> ParamId {
        self.members[0]
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Renders command bytes for log and error messages.
#[must_use]
pub fn command_label(command: &[u8]) -> String {
    if command.iter().all(|b| b.is_ascii_graphic()) {
        String::from_utf8_lossy(command).into_owned()
    } else {
        format!("0x{}", hex::encode(command))
    }
}

/// Sum of fixed widths and whether a variable-width member is present.
fn declared_width(module: &DeviceModule, group: &CommandGroup) -> (usize, bool) {
    group
        .members
        .iter()
        .map(|&id| module.param(id).size)
        .fold((0, false), |(total, variable), size| match size {
            PayloadSize::Fixed(n) => (total + n, variable),
            PayloadSize::Variable => (total, true),
        })
}

fn check_width(expected: usize, variable: bool, actual: usize) -> Result<()> {
    let fits = if variable {
        actual >= expected
    } else {
        actual == expected
    };
    if fits {
        Ok(())
    } else {
        Err(Error::PayloadSizeMismatch { expected, actual })
    }
}

/// Builds the request payload for a group, before framing.
///
/// - `Output` groups send the bare command and read the answer.
/// - `Input` groups send the command followed by every member's value.
/// - `Bidirectional` groups write like `Input` unless `for_inquiry` is set;
///   then they send the members' inquiry values, or fall back to the
///   current values if no member declares one.
pub fn encode_for_transmission(
    module: &DeviceModule,
    group: GroupId,
    for_inquiry: bool,
) -> Result<Bytes> {
    let group = module.group(group);
    let mut buf = BytesMut::with_capacity(group.command.len() + 16);
    buf.put_slice(&group.command);

    let write_values = match group.direction {
        Direction::Output => return Ok(buf.freeze()),
        Direction::Input => true,
        Direction::Bidirectional => !for_inquiry,
    };

    if !write_values {
        let mut inquiry = group
            .members
            .iter()
            .filter_map(|&id| module.param(id).inquiry_value.as_ref())
            .peekable();
        if inquiry.peek().is_some() {
            for value in inquiry {
                buf.put_slice(value);
            }
            let (expected, variable) = declared_width(module, group);
            check_width(expected, variable, buf.len() - group.command.len())?;
            return Ok(buf.freeze());
        }
        tracing::trace!(
            "group {} has no inquiry value, sending current values",
            command_label(&group.command)
        );
    }

    for &id in &group.members {
        module.param(id).value.write_to(&mut buf);
    }
    let (expected, variable) = declared_width(module, group);
    check_width(expected, variable, buf.len() - group.command.len())?;
    Ok(buf.freeze())
}

/// Applies a decoded response payload to the members of a group.
///
/// The payload must start with the group's command. Fixed-width members
/// take exactly their width; a trailing variable-width member takes the
/// rest. An `Input` group also accepts the bare command as an
/// acknowledgement. On any mismatch no value changes and every member is
/// reset to [`ParamStatus::Idle`].
pub fn decode_response(module: &mut DeviceModule, group: GroupId, payload: &[u8]) -> Result<()> {
    match parse_response(module, group, payload) {
        Ok(values) => {
            for (id, value) in values {
                let param = module.param_mut(id);
                if let Some(value) = value {
                    param.value = value;
                }
                param.status = ParamStatus::Received;
            }
            Ok(())
        }
        Err(e) => {
            module.set_group_status(group, ParamStatus::Idle);
            Err(e)
        }
    }
}

type Assignment = (ParamId, Option<crate::types::ParamValue>);

fn parse_response(module: &DeviceModule, group: GroupId, payload: &[u8]) -> Result<Vec<Assignment>> {
    let group = module.group(group);
    let Some(body) = payload.strip_prefix(&group.command[..]) else {
        let shown = payload.len().min(group.command.len());
        return Err(Error::CommandMismatch {
            expected: command_label(&group.command),
            actual: command_label(&payload[..shown]),
        });
    };

    if group.direction == Direction::Input && body.is_empty() {
        return Ok(group.members.iter().map(|&id| (id, None)).collect());
    }

    let (expected, variable) = declared_width(module, group);
    check_width(expected, variable, body.len())?;

    let mut offset = 0;
    let mut values = Vec::with_capacity(group.len());
    for &id in &group.members {
        let param = module.param(id);
        let width = param.size.fixed().unwrap_or(body.len() - offset);
        let value = param.value_type.parse(&body[offset..offset + width])?;
        offset += width;
        values.push((id, Some(value)));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParamSpec, ParamValue, ValueType};

    fn module() -> DeviceModule {
        DeviceModule::builder("test")
            .param(ParamSpec::new("range", Direction::Input, ValueType::U16, &b"RG"[..]).order(0))
            .param(ParamSpec::new("gate", Direction::Input, ValueType::U8, &b"RG"[..]).order(1))
            .param(ParamSpec::new("temp", Direction::Output, ValueType::I16, &b"TP"[..]))
            .param(
                ParamSpec::new("mode", Direction::Bidirectional, ValueType::U8, &b"MD"[..])
                    .inquiry(&b"?"[..]),
            )
            .param(ParamSpec::new("serial", Direction::Output, ValueType::U8, &b"SN"[..]).order(0))
            .param(
                ParamSpec::new("label", Direction::Output, ValueType::Text, &b"SN"[..]).order(1),
            )
            .build()
            .unwrap()
    }

    fn group(m: &DeviceModule, name: &str) -> GroupId {
        m.group_id_of(m.find(name).unwrap())
    }

    #[test]
    fn test_encode_input_group_concatenates_values() {
        let mut m = module();
        let id = m.find("range").unwrap();
        m.param_mut(id).value = ParamValue::U16(0x0102);
        let gate = m.find("gate").unwrap();
        m.param_mut(gate).value = ParamValue::U8(9);

        let payload = encode_for_transmission(&m, group(&m, "range"), false).unwrap();
        assert_eq!(payload.as_ref(), b"RG\x02\x01\x09");
    }

    #[test]
    fn test_encode_output_group_is_bare_command() {
        let m = module();
        let payload = encode_for_transmission(&m, group(&m, "temp"), true).unwrap();
        assert_eq!(payload.as_ref(), b"TP");
    }

    #[test]
    fn test_encode_bidirectional_inquiry_and_write() {
        let mut m = module();
        let g = group(&m, "mode");
        assert_eq!(encode_for_transmission(&m, g, true).unwrap().as_ref(), b"MD?");

        let id = m.find("mode").unwrap();
        m.param_mut(id).value = ParamValue::U8(3);
        assert_eq!(encode_for_transmission(&m, g, false).unwrap().as_ref(), b"MD\x03");
    }

    #[test]
    fn test_encode_inquiry_checks_declared_width() {
        let m = DeviceModule::builder("wide")
            .param(
                ParamSpec::new("mode", Direction::Bidirectional, ValueType::U16, &b"MD"[..])
                    .inquiry(&b"?????"[..]),
            )
            .param(
                ParamSpec::new("note", Direction::Bidirectional, ValueType::Text, &b"NT"[..])
                    .inquiry(&b"??"[..]),
            )
            .build()
            .unwrap();

        let err = encode_for_transmission(&m, group(&m, "mode"), true).unwrap_err();
        assert!(matches!(
            err,
            Error::PayloadSizeMismatch {
                expected: 2,
                actual: 5
            }
        ));
        // variable-width members accept any inquiry length
        let payload = encode_for_transmission(&m, group(&m, "note"), true).unwrap();
        assert_eq!(payload.as_ref(), b"NT??");
    }

    #[test]
    fn test_encode_rejects_oversized_bytes_value() {
        let mut m = DeviceModule::builder("blob")
            .param(
                ParamSpec::new("key", Direction::Input, ValueType::Bytes, &b"K"[..])
                    .size(PayloadSize::Fixed(4)),
            )
            .build()
            .unwrap();
        let id = m.find("key").unwrap();
        m.param_mut(id).value = ParamValue::Bytes(Bytes::from_static(b"12345"));
        let err = encode_for_transmission(&m, m.group_id_of(id), false).unwrap_err();
        assert!(matches!(
            err,
            Error::PayloadSizeMismatch {
                expected: 4,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_decode_assigns_members_in_order() {
        let mut m = module();
        let g = group(&m, "range");
        decode_response(&mut m, g, b"RG\x10\x00\x05").unwrap();

        let range = m.param_by_name("range").unwrap();
        assert_eq!(range.value, ParamValue::U16(16));
        assert_eq!(range.status, ParamStatus::Received);
        assert_eq!(m.param_by_name("gate").unwrap().value, ParamValue::U8(5));
    }

    #[test]
    fn test_decode_length_mismatch_is_atomic() {
        let mut m = module();
        let g = group(&m, "range");
        m.set_group_status(g, ParamStatus::Transmitting);

        for body in [&b"RG\x10\x00"[..], &b"RG\x10\x00\x05\x06"[..]] {
            let err = decode_response(&mut m, g, body).unwrap_err();
            assert!(matches!(err, Error::PayloadSizeMismatch { expected: 3, .. }));
            for name in ["range", "gate"] {
                let p = m.param_by_name(name).unwrap();
                assert_eq!(p.status, ParamStatus::Idle);
                assert_eq!(p.value.to_bytes().iter().sum::<u8>(), 0);
            }
        }
    }

    #[test]
    fn test_decode_variable_member_takes_remainder() {
        let mut m = module();
        let g = group(&m, "serial");
        decode_response(&mut m, g, b"SN\x07radar-7").unwrap();
        assert_eq!(m.param_by_name("serial").unwrap().value, ParamValue::U8(7));
        assert_eq!(
            m.param_by_name("label").unwrap().value,
            ParamValue::Text("radar-7".into())
        );

        assert!(decode_response(&mut m, g, b"SN").is_err());
    }

    #[test]
    fn test_decode_invalid_text_is_atomic() {
        let mut m = module();
        let g = group(&m, "serial");
        m.set_group_status(g, ParamStatus::Transmitting);

        let err = decode_response(&mut m, g, b"SN\x07rad\xff").unwrap_err();
        assert!(matches!(err, Error::InvalidText(_)));
        assert!(err.is_protocol());
        assert_eq!(m.param_by_name("serial").unwrap().value, ParamValue::U8(0));
        for name in ["serial", "label"] {
            assert_eq!(m.param_by_name(name).unwrap().status, ParamStatus::Idle);
        }
    }

    #[test]
    fn test_decode_command_mismatch() {
        let mut m = module();
        let g = group(&m, "temp");
        let err = decode_response(&mut m, g, b"XX\x01\x00").unwrap_err();
        assert!(matches!(err, Error::CommandMismatch { .. }));
    }

    #[test]
    fn test_decode_input_acknowledgement() {
        let mut m = module();
        let g = group(&m, "range");
        decode_response(&mut m, g, b"RG").unwrap();
        assert_eq!(
            m.param_by_name("gate").unwrap().status,
            ParamStatus::Received
        );
    }
}
