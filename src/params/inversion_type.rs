// geoinv/src/params/inversion_type.rs

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Closed set of survey/inversion kinds understood by the drivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InversionType {
    DirectCurrent3d,
    DirectCurrent2d,
    DirectCurrentPseudo3d,
    InducedPolarization3d,
    InducedPolarization2d,
    InducedPolarizationPseudo3d,
    JointSingleProperty,
    Tdem,
    Magnetotellurics,
    Tipper,
    Gravity,
    MagneticScalar,
    MagneticVector,
}

/// How the survey is partitioned before misfit assembly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TilingStrategy {
    Clustering,
    ElectrodeLines,
    SingleTile,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhysicalProperty {
    Density,
    Susceptibility,
    Conductivity,
    Chargeability,
}

impl InversionType {
    pub const ALL: [InversionType; 13] = [
        InversionType::DirectCurrent3d,
        InversionType::DirectCurrent2d,
        InversionType::DirectCurrentPseudo3d,
        InversionType::InducedPolarization3d,
        InversionType::InducedPolarization2d,
        InversionType::InducedPolarizationPseudo3d,
        InversionType::JointSingleProperty,
        InversionType::Tdem,
        InversionType::Magnetotellurics,
        InversionType::Tipper,
        InversionType::Gravity,
        InversionType::MagneticScalar,
        InversionType::MagneticVector,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InversionType::DirectCurrent3d => "direct current 3d",
            InversionType::DirectCurrent2d => "direct current 2d",
            InversionType::DirectCurrentPseudo3d => "direct current pseudo 3d",
            InversionType::InducedPolarization3d => "induced polarization 3d",
            InversionType::InducedPolarization2d => "induced polarization 2d",
            InversionType::InducedPolarizationPseudo3d => "induced polarization pseudo 3d",
            InversionType::JointSingleProperty => "joint single property",
            InversionType::Tdem => "tdem",
            InversionType::Magnetotellurics => "magnetotellurics",
            InversionType::Tipper => "tipper",
            InversionType::Gravity => "gravity",
            InversionType::MagneticScalar => "magnetic scalar",
            InversionType::MagneticVector => "magnetic vector",
        }
    }

    pub fn is_2d(&self) -> bool {
        matches!(
            self,
            InversionType::DirectCurrent2d | InversionType::InducedPolarization2d
        )
    }

    pub fn is_pseudo_3d(&self) -> bool {
        matches!(
            self,
            InversionType::DirectCurrentPseudo3d | InversionType::InducedPolarizationPseudo3d
        )
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, InversionType::MagneticVector)
    }

    pub fn is_electrode_survey(&self) -> bool {
        matches!(
            self,
            InversionType::DirectCurrent3d
                | InversionType::DirectCurrent2d
                | InversionType::DirectCurrentPseudo3d
                | InversionType::InducedPolarization3d
                | InversionType::InducedPolarization2d
                | InversionType::InducedPolarizationPseudo3d
        )
    }

    /// Number of model values carried by each active cell.
    pub fn model_components(&self) -> usize {
        if self.is_vector() {
            3
        } else {
            1
        }
    }

    /// The 2D driver that inverts a single line of a pseudo-3D survey.
    pub fn line_counterpart(&self) -> Option<InversionType> {
        match self {
            InversionType::DirectCurrentPseudo3d => Some(InversionType::DirectCurrent2d),
            InversionType::InducedPolarizationPseudo3d => {
                Some(InversionType::InducedPolarization2d)
            }
            _ => None,
        }
    }

    pub fn tiling_strategy(&self) -> TilingStrategy {
        match self {
            InversionType::DirectCurrent3d | InversionType::InducedPolarization3d => {
                TilingStrategy::ElectrodeLines
            }
            _ if self.is_2d() => TilingStrategy::SingleTile,
            _ => TilingStrategy::Clustering,
        }
    }

    pub fn physical_property(&self) -> Option<PhysicalProperty> {
        match self {
            InversionType::Gravity => Some(PhysicalProperty::Density),
            InversionType::MagneticScalar | InversionType::MagneticVector => {
                Some(PhysicalProperty::Susceptibility)
            }
            InversionType::InducedPolarization3d
            | InversionType::InducedPolarization2d
            | InversionType::InducedPolarizationPseudo3d => Some(PhysicalProperty::Chargeability),
            InversionType::JointSingleProperty => None,
            _ => Some(PhysicalProperty::Conductivity),
        }
    }

    /// Data components accepted through `<component>_channel` parameters.
    pub fn components(&self) -> &'static [&'static str] {
        match self {
            InversionType::Gravity => &[
                "gz", "gx", "gy", "guv", "gxy", "gxx", "gyy", "gzz", "gxz", "gyz",
            ],
            InversionType::MagneticScalar | InversionType::MagneticVector => &[
                "tmi", "bx", "by", "bz", "bxx", "bxy", "bxz", "byy", "byz", "bzz",
            ],
            InversionType::DirectCurrent3d
            | InversionType::DirectCurrent2d
            | InversionType::DirectCurrentPseudo3d => &["potential"],
            InversionType::InducedPolarization3d
            | InversionType::InducedPolarization2d
            | InversionType::InducedPolarizationPseudo3d => &["chargeability"],
            InversionType::Tdem => &["x", "y", "z"],
            InversionType::Magnetotellurics => &[
                "zxx_real", "zxx_imag", "zxy_real", "zxy_imag", "zyx_real", "zyx_imag",
                "zyy_real", "zyy_imag",
            ],
            InversionType::Tipper => &["txz_real", "txz_imag", "tyz_real", "tyz_imag"],
            InversionType::JointSingleProperty => &[],
        }
    }

    pub fn valid_names() -> Vec<&'static str> {
        Self::ALL.iter().map(|kind| kind.as_str()).collect()
    }
}

impl fmt::Display for InversionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InversionType {
    type Err = UnknownInversionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .find(|kind| kind.as_str() == needle)
            .copied()
            .ok_or_else(|| UnknownInversionType(s.to_string()))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Inversion type {0:?} is not supported")]
pub struct UnknownInversionType(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_from_str() {
        for kind in InversionType::ALL {
            assert_eq!(kind.as_str().parse::<InversionType>().unwrap(), kind);
        }
        assert_eq!(
            "Magnetic Vector".parse::<InversionType>().unwrap(),
            InversionType::MagneticVector
        );
        assert!("mvi".parse::<InversionType>().is_err());
    }

    #[test]
    fn test_tiling_strategy_by_family() {
        assert_eq!(
            InversionType::DirectCurrent3d.tiling_strategy(),
            TilingStrategy::ElectrodeLines
        );
        assert_eq!(
            InversionType::InducedPolarization2d.tiling_strategy(),
            TilingStrategy::SingleTile
        );
        assert_eq!(
            InversionType::Gravity.tiling_strategy(),
            TilingStrategy::Clustering
        );
    }

    #[test]
    fn test_pseudo_3d_counterparts() {
        assert_eq!(
            InversionType::DirectCurrentPseudo3d.line_counterpart(),
            Some(InversionType::DirectCurrent2d)
        );
        assert_eq!(InversionType::Gravity.line_counterpart(), None);
    }
}
