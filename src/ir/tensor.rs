use serde::{Deserialize, Serialize};

use crate::errors::{FuseError, FuseResult};
use crate::types::TensorId;

/// Role of a tensor inside its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorAttr {
    Input,
    Output,
    Constant,
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElemType {
    F32,
}

impl ElemType {
    pub fn byte_size(self) -> usize {
        match self {
            ElemType::F32 => 4,
        }
    }
}

/// Asymmetric affine quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quant {
    pub scale: f32,
    pub zero_point: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub shape: Vec<usize>,
    pub elem: ElemType,
    pub attr: TensorAttr,
    pub quant: Option<Quant>,
}

impl TensorSpec {
    pub fn new(shape: Vec<usize>, elem: ElemType, attr: TensorAttr) -> Self {
        Self { shape, elem, attr, quant: None }
    }

    pub fn f32(shape: Vec<usize>, attr: TensorAttr) -> Self {
        Self::new(shape, ElemType::F32, attr)
    }

    /// Same element type and quantization, new shape and role.
    pub fn derived(&self, shape: Vec<usize>, attr: TensorAttr) -> Self {
        Self { shape, elem: self.elem, attr, quant: self.quant }
    }

    /// Same spec with only the shape replaced.
    pub fn with_shape(&self, shape: Vec<usize>) -> Self {
        Self { shape, ..self.clone() }
    }

    pub fn byte_size(&self) -> usize {
        self.shape.iter().product::<usize>() * self.elem.byte_size()
    }
}

/// An IR value. Constants carry their backing bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tensor {
    id: TensorId,
    spec: TensorSpec,
    data: Option<Vec<u8>>,
}

impl Tensor {
    pub(crate) fn new(id: TensorId, spec: TensorSpec, data: Option<Vec<u8>>) -> Self {
        Self { id, spec, data }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn shape(&self) -> &[usize] {
        &self.spec.shape
    }

    pub fn attr(&self) -> TensorAttr {
        self.spec.attr
    }

    pub(crate) fn set_attr(&mut self, attr: TensorAttr) {
        self.spec.attr = attr;
    }

    pub fn is_constant(&self) -> bool {
        self.spec.attr == TensorAttr::Constant
    }

    pub fn byte_size(&self) -> usize {
        self.spec.byte_size()
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Copies the backing bytes into `buf`, which must be exactly
    /// `byte_size()` long.
    pub fn copy_out(&self, buf: &mut [u8]) -> FuseResult<()> {
        let data = self.data.as_deref().ok_or_else(|| {
            FuseError::MapMiss(format!("tensor {:?} has no backing data", self.id))
        })?;
        if buf.len() != data.len() {
            return Err(FuseError::ShapeMismatch {
                expected: vec![data.len()],
                found: vec![buf.len()],
            });
        }
        buf.copy_from_slice(data);
        Ok(())
    }

    /// Decodes the backing bytes as little-endian f32 values.
    pub fn f32_data(&self) -> Option<Vec<f32>> {
        let data = self.data.as_deref()?;
        Some(
            data.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

/// Encodes f32 values as the little-endian bytes a constant tensor carries.
pub fn bytes_from_f32(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}
