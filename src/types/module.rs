//! Device module definitions.
//!
//! A module owns its parameters in an arena indexed by [`ParamId`] and
//! indexes command groups by their command bytes.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::group::{CommandGroup, GroupId, command_label};
use crate::types::param::{ParamId, ParamSpec, ParamStatus, PayloadSize};

/// Commands used to identify a device after the port opens.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Inquiry returning the module id.
    pub module_command: Bytes,
    /// Module id the device must report.
    pub module_id: Bytes,
    /// Optional inquiry returning the instance id.
    pub instance_command: Option<Bytes>,
}

/// A device definition: parameters, their command groups and identity.
#[derive(Debug, Clone)]
pub struct DeviceModule {
    name: String,
    identity: Identity,
    params: Vec<ParamSpec>,
    by_name: HashMap<String, ParamId>,
    groups: Vec<CommandGroup>,
    by_command: HashMap<Bytes, GroupId>,
    param_group: Vec<GroupId>,
}

impl DeviceModule {
    /// Starts building a module.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> DeviceModuleBuilder {
        DeviceModuleBuilder {
            name: name.into(),
            identity: Identity::default(),
            params: Vec::new(),
        }
    }

    /// Module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity handshake commands.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// All parameters, indexed by [`ParamId`].
    #[must_use]
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// All parameters, for updating values and statuses.
    pub(crate) fn params_mut(&mut self) -> &mut [ParamSpec] {
        &mut self.params
    }

    /// Returns a parameter by id.
    #[must_use]
    pub fn param(&self, id: ParamId) -> &ParamSpec {
        &self.params[id.0]
    }

    /// Returns a parameter by id for modification.
    pub fn param_mut(&mut self, id: ParamId) -> &mut ParamSpec {
        &mut self.params[id.0]
    }

    /// Looks up a parameter id by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<ParamId> {
        self.by_name.get(name).copied()
    }

    /// Looks up a parameter by name.
    #[must_use]
    pub fn param_by_name(&self, name: &str) -> Option<&ParamSpec> {
        self.find(name).map(|id| self.param(id))
    }

    /// All command groups, indexed by [`GroupId`].
    #[must_use]
    pub fn groups(&self) -> &[CommandGroup] {
        &self.groups
    }

    /// Returns a group by id.
    #[must_use]
    pub fn group(&self, id: GroupId) -> &CommandGroup {
        &self.groups[id.0]
    }

    /// Returns the id of the group a parameter belongs to.
    #[must_use]
    pub fn group_id_of(&self, param: ParamId) -> GroupId {
        self.param_group[param.0]
    }

    /// Returns the group a parameter belongs to.
    #[must_use]
    pub fn group_of(&self, param: ParamId) -> &CommandGroup {
        self.group(self.group_id_of(param))
    }

    /// Looks up a group by its command bytes.
    #[must_use]
    pub fn group_by_command(&self, command: &[u8]) -> Option<GroupId> {
        self.by_command.get(command).copied()
    }

    /// Sets the status of every member of a group.
    pub fn set_group_status(&mut self, group: GroupId, status: ParamStatus) {
        for &id in &self.groups[group.0].members {
            self.params[id.0].status = status;
        }
    }

    /// Resets every parameter to [`ParamStatus::Idle`].
    pub fn reset_status(&mut self) {
        for param in &mut self.params {
            param.status = ParamStatus::Idle;
        }
    }
}

/// Builder for [`DeviceModule`].
#[derive(Debug)]
pub struct DeviceModuleBuilder {
    name: String,
    identity: Identity,
    params: Vec<ParamSpec>,
}

impl DeviceModuleBuilder {
    /// Sets the module-id inquiry and the id the device must report.
    #[must_use]
    pub fn identity(mut self, command: impl Into<Bytes>, module_id: impl Into<Bytes>) -> Self {
        self.identity.module_command = command.into();
        self.identity.module_id = module_id.into();
        self
    }

    /// Sets the instance-id inquiry.
    #[must_use]
    pub fn instance_inquiry(mut self, command: impl Into<Bytes>) -> Self {
        self.identity.instance_command = Some(command.into());
        self
    }

    /// Adds a parameter.
    #[must_use]
    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Validates the parameters and indexes their command groups.
    pub fn build(self) -> Result<DeviceModule> {
        let mut by_name = HashMap::with_capacity(self.params.len());
        let mut by_command: HashMap<Bytes, GroupId> = HashMap::new();
        let mut groups: Vec<CommandGroup> = Vec::new();
        let mut param_group = Vec::with_capacity(self.params.len());

        for (index, param) in self.params.iter().enumerate() {
            param.validate()?;
            let id = ParamId(index);
            if by_name.insert(param.name.clone(), id).is_some() {
                return Err(Error::InvalidParam {
                    name: param.name.clone(),
                    reason: "duplicate name".into(),
                });
            }
            let group = *by_command.entry(param.command.clone()).or_insert_with(|| {
                groups.push(CommandGroup {
                    id: GroupId(groups.len()),
                    command: param.command.clone(),
                    members: Vec::new(),
                    direction: param.direction,
                });
                GroupId(groups.len() - 1)
            });
            groups[group.0].members.push(id);
            param_group.push(group);
        }

        for group in &mut groups {
            group.members.sort_by_key(|id| self.params[id.0].order);
            check_group(&self.params, group)?;
        }

        tracing::debug!(
            "module {}: {} params in {} command groups",
            self.name,
            self.params.len(),
            groups.len()
        );

        Ok(DeviceModule {
            name: self.name,
            identity: self.identity,
            params: self.params,
            by_name,
            groups,
            by_command,
            param_group,
        })
    }
}

fn check_group(params: &[ParamSpec], group: &CommandGroup) -> Result<()> {
    let label = || command_label(&group.command);
    for (position, id) in group.members.iter().enumerate() {
        let param = &params[id.0];
        if usize::from(param.order) != position {
            return Err(Error::GroupOrderGap {
                command: label(),
                index: u16::try_from(position).unwrap_or(u16::MAX),
            });
        }
        if param.direction != group.direction {
            return Err(Error::MixedDirection { command: label() });
        }
        if param.size == PayloadSize::Variable && position + 1 != group.members.len() {
            return Err(Error::InvalidParam {
                name: param.name.clone(),
                reason: "variable size must be the last member of its group".into(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, ValueType};

    fn range(order: u16) -> ParamSpec {
        ParamSpec::new(
            format!("range{order}"),
            Direction::Input,
            ValueType::U8,
            &b"RG"[..],
        )
        .order(order)
    }

    #[test]
    fn test_groups_indexed_by_command() {
        let module = DeviceModule::builder("radar")
            .param(range(1))
            .param(range(0))
            .param(ParamSpec::new("temp", Direction::Output, ValueType::I16, &b"TP"[..]))
            .build()
            .unwrap();

        let rg = module.group_by_command(b"RG").unwrap();
        let names: Vec<_> = module
            .group(rg)
            .members
            .iter()
            .map(|&id| module.param(id).name.as_str())
            .collect();
        assert_eq!(names, ["range0", "range1"]);
        assert_eq!(module.group(rg).leader(), module.find("range0").unwrap());

        let temp = module.find("temp").unwrap();
        assert_eq!(module.group_of(temp).len(), 1);
        assert_eq!(module.group_by_command(b"TP"), Some(module.group_id_of(temp)));
        assert_eq!(module.group_by_command(b"XX"), None);
    }

    #[test]
    fn test_order_gap_is_rejected() {
        let result = DeviceModule::builder("radar")
            .param(range(0))
            .param(range(2))
            .build();
        assert!(matches!(result, Err(Error::GroupOrderGap { index: 1, .. })));
    }

    #[test]
    fn test_mixed_direction_is_rejected() {
        let result = DeviceModule::builder("radar")
            .param(range(0))
            .param(ParamSpec::new("x", Direction::Output, ValueType::U8, &b"RG"[..]).order(1))
            .build();
        assert!(matches!(result, Err(Error::MixedDirection { .. })));
    }

    #[test]
    fn test_variable_member_must_be_last() {
        let result = DeviceModule::builder("radar")
            .param(ParamSpec::new("name", Direction::Output, ValueType::Text, &b"ID"[..]).order(0))
            .param(ParamSpec::new("rev", Direction::Output, ValueType::U8, &b"ID"[..]).order(1))
            .build();
        assert!(matches!(result, Err(Error::InvalidParam { .. })));
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let result = DeviceModule::builder("radar")
            .param(range(0))
            .param(range(0).order(1))
            .build();
        assert!(matches!(result, Err(Error::InvalidParam { .. })));
    }
}
