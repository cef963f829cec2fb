//! Scalar masks derived from the auxiliary simulation fields.

use std::fmt;
use std::str::FromStr;

use glam::Vec2;

use crate::grid::FieldId;

/// Auxiliary output a mask can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskSource {
    Sediment,
    HeightDiff,
    Flux,
    WaterLevel,
    WaterSpeed,
}

/// How a multi-channel cell collapses to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// First channel as-is.
    Scalar,
    /// Length of the first two channels.
    Magnitude,
    /// Sum over all channels.
    Sum,
}

const MASK_TABLE: [(MaskSource, &str, FieldId, Reduction); 5] = [
    (MaskSource::Sediment, "sediment", FieldId::Sediment, Reduction::Scalar),
    (MaskSource::HeightDiff, "height-diff", FieldId::ErodedAmount, Reduction::Scalar),
    (MaskSource::Flux, "flux", FieldId::Flux, Reduction::Sum),
    (MaskSource::WaterLevel, "water-level", FieldId::Water, Reduction::Scalar),
    (MaskSource::WaterSpeed, "water-speed", FieldId::WaterVelocity, Reduction::Magnitude),
];

impl MaskSource {
    pub const ALL: [MaskSource; 5] = [
        MaskSource::Sediment,
        MaskSource::HeightDiff,
        MaskSource::Flux,
        MaskSource::WaterLevel,
        MaskSource::WaterSpeed,
    ];

    fn entry(self) -> &'static (MaskSource, &'static str, FieldId, Reduction) {
        &MASK_TABLE[self as usize]
    }

    /// Field the mask is read from.
    pub fn field(self) -> FieldId {
        self.entry().2
    }

    pub fn reduction(self) -> Reduction {
        self.entry().3
    }

    pub fn name(self) -> &'static str {
        self.entry().1
    }
}

impl fmt::Display for MaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MaskSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.replace('_', "-");
        MASK_TABLE
            .iter()
            .find(|(_, name, _, _)| name.eq_ignore_ascii_case(&wanted))
            .map(|(source, _, _, _)| *source)
            .ok_or_else(|| {
                let names: Vec<_> = MASK_TABLE.iter().map(|e| e.1).collect();
                format!("unknown mask source '{}', expected one of: {}", s, names.join(", "))
            })
    }
}

impl Reduction {
    /// Collapses row-major cells of `channels` floats to one value each.
    pub fn apply(self, data: &[f32], channels: usize) -> Vec<f32> {
        let cells = data.chunks_exact(channels.max(1));
        match self {
            Reduction::Scalar => cells.map(|c| c[0]).collect(),
            Reduction::Magnitude => cells
                .map(|c| Vec2::new(c[0], c.get(1).copied().unwrap_or(0.0)).length())
                .collect(),
            Reduction::Sum => cells.map(|c| c.iter().sum()).collect(),
        }
    }
}
