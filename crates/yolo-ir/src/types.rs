//! Element and shape types for graph tensors.

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Scalar {
    F32,
}

impl Scalar {
    /// Size of one element in bytes.
    pub fn byte_width(self) -> usize {
        match self {
            Self::F32 => 4,
        }
    }
}

/// Static shape of a tensor flowing through the graph.
///
/// Feature maps are batch-less `[channels, height, width]`; detection
/// tables are `[rows, columns]`.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct TensorShape {
    pub dims: Vec<u32>,
}

impl TensorShape {
    /// A `[channels, height, width]` feature map shape.
    pub fn chw(channels: u32, height: u32, width: u32) -> Self {
        Self {
            dims: vec![channels, height, width],
        }
    }

    /// A `[rows, columns]` table shape.
    pub fn table(rows: u32, columns: u32) -> Self {
        Self {
            dims: vec![rows, columns],
        }
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Leading dimension (channels for feature maps, rows for tables).
    pub fn channels(&self) -> u32 {
        self.dims.first().copied().unwrap_or(0)
    }

    /// `(height, width)` of a rank-3 feature map.
    pub fn spatial(&self) -> Option<(u32, u32)> {
        match self.dims.as_slice() {
            [_, h, w] => Some((*h, *w)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chw_accessors() {
        let s = TensorShape::chw(64, 304, 304);
        assert_eq!(s.rank(), 3);
        assert_eq!(s.channels(), 64);
        assert_eq!(s.spatial(), Some((304, 304)));
        assert_eq!(Scalar::F32.byte_width(), 4);
    }

    #[test]
    fn table_has_no_spatial_extent() {
        let s = TensorShape::table(22743, 10);
        assert_eq!(s.rank(), 2);
        assert_eq!(s.channels(), 22743);
        assert!(s.spatial().is_none());
    }
}
