//! Process role types.
//!
//! `ProcessRole` identifies one of the independent simulation processes that
//! share the record bus. Roles are written into record headers as a single
//! byte and into the restart signal file as a single character tag; in the
//! role table they appear as kebab-case names (`"topology-mapper"`).

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

// ─── ProcessRole ────────────────────────────────────────────────────

/// Identity of a bus participant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum ProcessRole {
    /// Engineering console (reactor, coolant, electrical systems).
    Engineering = 0,
    /// Piloting console (flight, navigation, radar).
    Piloting = 1,
    /// Topological map tool.
    TopologyMapper = 2,
    /// Any other peer program.
    Other = 3,
}

impl ProcessRole {
    /// Every role, in code order.
    pub const ALL: [Self; 4] = [
        Self::Engineering,
        Self::Piloting,
        Self::TopologyMapper,
        Self::Other,
    ];

    /// Convert from the raw header byte. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Engineering),
            1 => Some(Self::Piloting),
            2 => Some(Self::TopologyMapper),
            3 => Some(Self::Other),
            _ => None,
        }
    }

    /// Raw header byte.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Single-character tag used in the restart signal file.
    pub const fn tag(self) -> u8 {
        match self {
            Self::Engineering => b'E',
            Self::Piloting => b'P',
            Self::TopologyMapper => b'T',
            Self::Other => b'O',
        }
    }

    /// Inverse of [`ProcessRole::tag`].
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'E' => Some(Self::Engineering),
            b'P' => Some(Self::Piloting),
            b'T' => Some(Self::TopologyMapper),
            b'O' => Some(Self::Other),
            _ => None,
        }
    }

    /// Kebab-case name as used in the role table.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Engineering => "engineering",
            Self::Piloting => "piloting",
            Self::TopologyMapper => "topology-mapper",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "engineering" => Ok(Self::Engineering),
            "piloting" => Ok(Self::Piloting),
            "topology-mapper" | "topology_mapper" => Ok(Self::TopologyMapper),
            "other" => Ok(Self::Other),
            _ => Err(format!(
                "unknown ProcessRole: {s:?}, expected one of \"engineering\", \"piloting\", \"topology-mapper\", \"other\""
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        for role in ProcessRole::ALL {
            assert_eq!(ProcessRole::from_u8(role.code()), Some(role));
        }
        assert!(ProcessRole::from_u8(4).is_none());
        assert!(ProcessRole::from_u8(255).is_none());
    }

    #[test]
    fn tags_are_unique() {
        for role in ProcessRole::ALL {
            assert_eq!(ProcessRole::from_tag(role.tag()), Some(role));
        }
        assert!(ProcessRole::from_tag(b'-').is_none());
    }

    #[test]
    fn parse_kebab_names() {
        assert_eq!(
            "topology-mapper".parse::<ProcessRole>(),
            Ok(ProcessRole::TopologyMapper)
        );
        assert_eq!("piloting".parse::<ProcessRole>(), Ok(ProcessRole::Piloting));
        assert!("Piloting".parse::<ProcessRole>().is_err());
    }

    #[test]
    fn serde_uses_kebab_case() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Wrapper {
            role: ProcessRole,
        }

        let w: Wrapper = toml::from_str("role = \"topology-mapper\"").unwrap();
        assert_eq!(w.role, ProcessRole::TopologyMapper);
        assert!(toml::from_str::<Wrapper>("role = \"navigator\"").is_err());
    }

    #[test]
    fn display_matches_config_name() {
        for role in ProcessRole::ALL {
            assert_eq!(role.to_string().parse::<ProcessRole>(), Ok(role));
        }
    }
}
