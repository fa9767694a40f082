//! Derived-image instructions: roles, encodings, variant specs and plans.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, str::FromStr};
use thiserror::Error;

/// Symbolic size role a URL is published under.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Thumbnail,
    Medium,
    Large,
    Original,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Thumbnail, Role::Medium, Role::Large, Role::Original];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Thumbnail => "thumbnail",
            Role::Medium => "medium",
            Role::Large => "large",
            Role::Original => "original",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.as_str() == value)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output encoding for a derived variant.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputEncoding {
    /// Lossy, honours `VariantSpec::quality`. Transparency is flattened onto white.
    Jpeg,
    Png,
    /// Lossy WebP at `VariantSpec::quality`, alpha preserved.
    Webp,
}

impl FromStr for OutputEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::Webp),
            other => Err(format!(
                "unknown output format `{other}` (expected webp, jpeg or png)"
            )),
        }
    }
}

impl OutputEncoding {
    pub fn content_type(self) -> &'static str {
        match self {
            OutputEncoding::Jpeg => "image/jpeg",
            OutputEncoding::Png => "image/png",
            OutputEncoding::Webp => "image/webp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputEncoding::Jpeg => "jpg",
            OutputEncoding::Png => "png",
            OutputEncoding::Webp => "webp",
        }
    }
}

/// One derived-image instruction.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct VariantSpec {
    pub role: Role,

    /// Bounding box for the longest side. `None` keeps the decoded size.
    pub max_dimension: Option<u32>,

    pub encoding: OutputEncoding,

    /// Encoder quality in `1..=100`.
    pub quality: u8,
}

/// A role served by another variant's bytes and URL.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoleAlias {
    pub role: Role,
    pub target: Role,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("a derivation plan needs at least one variant")]
    Empty,
    #[error("role `{0}` appears more than once")]
    DuplicateRole(Role),
    #[error("alias `{role}` targets `{target}`, which is not a variant in this plan")]
    DanglingAlias { role: Role, target: Role },
    #[error("role `{0}` is not covered by the plan")]
    MissingRole(Role),
}

/// Ordered variants for one upload plus the roles that reuse them.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DerivationPlan {
    variants: Vec<VariantSpec>,
    aliases: Vec<RoleAlias>,
}

impl DerivationPlan {
    /// Build a plan, checking that it has at least one variant, that each
    /// role appears once, that aliases point at variants, and that all four
    /// roles are covered.
    pub fn new(variants: Vec<VariantSpec>, aliases: Vec<RoleAlias>) -> Result<Self, PlanError> {
        if variants.is_empty() {
            return Err(PlanError::Empty);
        }
        let plan = Self { variants, aliases };

        let mut seen = BTreeSet::new();
        for role in plan.roles() {
            if !seen.insert(role) {
                return Err(PlanError::DuplicateRole(role));
            }
        }

        for alias in &plan.aliases {
            if !plan.variants.iter().any(|v| v.role == alias.target) {
                return Err(PlanError::DanglingAlias {
                    role: alias.role,
                    target: alias.target,
                });
            }
        }

        if let Some(missing) = Role::ALL.into_iter().find(|r| !seen.contains(r)) {
            return Err(PlanError::MissingRole(missing));
        }

        Ok(plan)
    }

    /// Build a plan from a layout that is valid by construction.
    pub(crate) fn from_fixed(variants: Vec<VariantSpec>, aliases: Vec<RoleAlias>) -> Self {
        debug_assert!(Self::new(variants.clone(), aliases.clone()).is_ok());
        Self { variants, aliases }
    }

    pub fn variants(&self) -> &[VariantSpec] {
        &self.variants
    }

    pub fn aliases(&self) -> &[RoleAlias] {
        &self.aliases
    }

    /// Every role the plan publishes, variants first.
    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.variants
            .iter()
            .map(|v| v.role)
            .chain(self.aliases.iter().map(|a| a.role))
    }
}
