//! Decides which variants to derive for an upload.

use crate::models::{
    upload::UploadRequest,
    variant::{DerivationPlan, OutputEncoding, Role, RoleAlias, VariantSpec},
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const THUMBNAIL_MAX: u32 = 200;
pub const MEDIUM_MAX: u32 = 1200;
pub const FULL_MEDIUM_MAX: u32 = 800;
pub const FULL_LARGE_MAX: u32 = 1920;
pub const DEFAULT_QUALITY: u8 = 85;

/// How many distinct encodes an upload gets.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DerivationProfile {
    /// One medium encode; every other role reuses it.
    Fast,
    /// Thumbnail + medium; `large` and `original` reuse medium.
    #[default]
    Balanced,
    /// Four distinct encodes, `original` kept at decoded size.
    Full,
}

impl FromStr for DerivationProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "full" => Ok(Self::Full),
            other => Err(format!(
                "unknown derivation profile `{other}` (expected fast, balanced or full)"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DerivationPlanner {
    profile: DerivationProfile,
    encoding: OutputEncoding,
    quality: u8,
}

impl Default for DerivationPlanner {
    fn default() -> Self {
        Self::new(DerivationProfile::default(), DEFAULT_QUALITY)
    }
}

impl DerivationPlanner {
    pub fn new(profile: DerivationProfile, quality: u8) -> Self {
        Self {
            profile,
            encoding: OutputEncoding::Webp,
            quality: quality.clamp(1, 100),
        }
    }

    /// Encode every variant as `encoding` instead of WebP.
    pub fn with_encoding(mut self, encoding: OutputEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn profile(&self) -> DerivationProfile {
        self.profile
    }

    /// Build the plan for an upload already known to be an image.
    ///
    /// The plan depends only on the configured profile; the upload is taken so
    /// that per-input policies can be added without changing callers.
    pub fn plan(&self, _upload: &UploadRequest) -> DerivationPlan {
        let spec = |role, max_dimension| VariantSpec {
            role,
            max_dimension,
            encoding: self.encoding,
            quality: self.quality,
        };
        let alias = |role, target| RoleAlias { role, target };

        match self.profile {
            DerivationProfile::Fast => DerivationPlan::from_fixed(
                vec![spec(Role::Medium, Some(MEDIUM_MAX))],
                vec![
                    alias(Role::Thumbnail, Role::Medium),
                    alias(Role::Large, Role::Medium),
                    alias(Role::Original, Role::Medium),
                ],
            ),
            DerivationProfile::Balanced => DerivationPlan::from_fixed(
                vec![
                    spec(Role::Thumbnail, Some(THUMBNAIL_MAX)),
                    spec(Role::Medium, Some(MEDIUM_MAX)),
                ],
                vec![
                    alias(Role::Large, Role::Medium),
                    alias(Role::Original, Role::Medium),
                ],
            ),
            DerivationProfile::Full => DerivationPlan::from_fixed(
                vec![
                    spec(Role::Thumbnail, Some(THUMBNAIL_MAX)),
                    spec(Role::Medium, Some(FULL_MEDIUM_MAX)),
                    spec(Role::Large, Some(FULL_LARGE_MAX)),
                    spec(Role::Original, None),
                ],
                vec![],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::BTreeSet;

    fn upload() -> UploadRequest {
        UploadRequest::new(Bytes::from_static(b"..."), "image/jpeg", "house.jpg")
    }

    #[test]
    fn balanced_plan_has_thumbnail_and_medium_with_aliases() {
        let plan = DerivationPlanner::default().plan(&upload());

        let variants: Vec<(Role, Option<u32>)> = plan
            .variants()
            .iter()
            .map(|v| (v.role, v.max_dimension))
            .collect();
        assert_eq!(
            variants,
            vec![
                (Role::Thumbnail, Some(200)),
                (Role::Medium, Some(1200))
            ]
        );
        assert!(plan.aliases().iter().all(|a| a.target == Role::Medium));
        assert!(
            plan.variants()
                .iter()
                .all(|v| v.encoding == OutputEncoding::Webp && v.quality == 85)
        );
    }

    #[test]
    fn encoding_can_be_overridden() {
        let plan = DerivationPlanner::new(DerivationProfile::Full, 85)
            .with_encoding(OutputEncoding::Jpeg)
            .plan(&upload());
        assert!(plan.variants().iter().all(|v| v.encoding == OutputEncoding::Jpeg));
    }

    #[test]
    fn every_profile_covers_all_roles_once() {
        for profile in [
            DerivationProfile::Fast,
            DerivationProfile::Balanced,
            DerivationProfile::Full,
        ] {
            let plan = DerivationPlanner::new(profile, 80).plan(&upload());
            let roles: Vec<Role> = plan.roles().collect();
            let unique: BTreeSet<Role> = roles.iter().copied().collect();
            assert_eq!(roles.len(), 4, "{profile:?}");
            assert_eq!(unique.len(), 4, "{profile:?}");
            assert!(
                DerivationPlan::new(plan.variants().to_vec(), plan.aliases().to_vec()).is_ok()
            );
        }
    }

    #[test]
    fn full_profile_keeps_original_size() {
        let plan = DerivationPlanner::new(DerivationProfile::Full, 85).plan(&upload());
        let original = plan
            .variants()
            .iter()
            .find(|v| v.role == Role::Original)
            .unwrap();
        assert_eq!(original.max_dimension, None);
        assert!(plan.aliases().is_empty());
    }

    #[test]
    fn quality_is_clamped() {
        let plan = DerivationPlanner::new(DerivationProfile::Fast, 0).plan(&upload());
        assert_eq!(plan.variants()[0].quality, 1);
    }

    #[test]
    fn profile_parses_case_insensitively() {
        assert_eq!("FULL".parse::<DerivationProfile>(), Ok(DerivationProfile::Full));
        assert!("huge".parse::<DerivationProfile>().is_err());
    }
}
