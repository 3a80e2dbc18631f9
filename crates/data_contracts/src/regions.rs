//! BraTS annotation classes and the overlapping clinical regions derived from them.
//!
//! Raw annotations carry one class per voxel. Training and scoring work on three
//! overlapping regions instead, always stacked in [`REGION_ORDER`]:
//!
//! | channel | region | classes |
//! |---------|--------|---------|
//! | 0 | tumor core (TC) | 2, 3 |
//! | 1 | whole tumor (WT) | 1, 2, 3 |
//! | 2 | enhancing tumor (ET) | 2 |

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BratsClass {
    Background,
    PeritumoralEdema,
    EnhancingTumor,
    NecroticCore,
}

impl BratsClass {
    /// Map a raw voxel value; only exact values in {0,1,2,3} have a class.
    pub fn from_value(value: f32) -> Option<Self> {
        if value.fract() != 0.0 {
            return None;
        }
        match value as i64 {
            0 => Some(BratsClass::Background),
            1 => Some(BratsClass::PeritumoralEdema),
            2 => Some(BratsClass::EnhancingTumor),
            3 => Some(BratsClass::NecroticCore),
            _ => None,
        }
    }

    pub fn value(&self) -> u8 {
        match self {
            BratsClass::Background => 0,
            BratsClass::PeritumoralEdema => 1,
            BratsClass::EnhancingTumor => 2,
            BratsClass::NecroticCore => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BratsRegion {
    TumorCore,
    WholeTumor,
    EnhancingTumor,
}

pub const REGION_ORDER: [BratsRegion; 3] = [
    BratsRegion::TumorCore,
    BratsRegion::WholeTumor,
    BratsRegion::EnhancingTumor,
];

impl BratsRegion {
    pub fn channel(&self) -> usize {
        match self {
            BratsRegion::TumorCore => 0,
            BratsRegion::WholeTumor => 1,
            BratsRegion::EnhancingTumor => 2,
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            BratsRegion::TumorCore => "tc",
            BratsRegion::WholeTumor => "wt",
            BratsRegion::EnhancingTumor => "et",
        }
    }

    pub fn contains(&self, class: BratsClass) -> bool {
        match self {
            BratsRegion::TumorCore => matches!(
                class,
                BratsClass::EnhancingTumor | BratsClass::NecroticCore
            ),
            BratsRegion::WholeTumor => class != BratsClass::Background,
            BratsRegion::EnhancingTumor => class == BratsClass::EnhancingTumor,
        }
    }

    /// Membership of a raw label value; unknown values belong to no region.
    pub fn contains_value(&self, value: f32) -> bool {
        BratsClass::from_value(value).is_some_and(|class| self.contains(class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_channels_follow_order() {
        for (idx, region) in REGION_ORDER.iter().enumerate() {
            assert_eq!(region.channel(), idx);
        }
    }

    #[test]
    fn tumor_regions_nest_inside_whole_tumor() {
        for value in 0..4u8 {
            let class = BratsClass::from_value(value as f32).unwrap();
            assert_eq!(class.value(), value);
            if BratsRegion::TumorCore.contains(class) || BratsRegion::EnhancingTumor.contains(class)
            {
                assert!(BratsRegion::WholeTumor.contains(class));
            }
        }
    }

    #[test]
    fn unknown_values_belong_nowhere() {
        assert!(BratsClass::from_value(7.0).is_none());
        assert!(!BratsRegion::WholeTumor.contains_value(-1.0));
    }

    #[test]
    fn fractional_values_are_not_rounded() {
        assert!(BratsClass::from_value(1.6).is_none());
        assert!(BratsClass::from_value(f32::NAN).is_none());
        assert!(!BratsRegion::EnhancingTumor.contains_value(1.6));
        assert!(!BratsRegion::EnhancingTumor.contains_value(2.0001));
        assert!(BratsRegion::EnhancingTumor.contains_value(2.0));
    }
}
