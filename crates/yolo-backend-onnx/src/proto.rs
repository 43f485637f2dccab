//! ONNX protobuf types via prost derive.
//!
//! Hand-defined message types mirroring `onnx.proto`.
//! Field tags correspond to the official ONNX protobuf field numbers. Only
//! the fields the detector lowering emits are declared.

use prost::Message;

/// ONNX data type constants from `TensorProto.DataType`.
pub mod data_type {
    pub const FLOAT: i32 = 1;
}

/// `AttributeProto.AttributeType` constants.
pub mod attribute_type {
    pub const FLOAT: i32 = 1;
    pub const INT: i32 = 2;
    pub const FLOATS: i32 = 6;
    pub const INTS: i32 = 7;
}

/// Top-level ONNX model container.
#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(int64, tag = "1")]
    pub ir_version: i64,
    #[prost(string, tag = "2")]
    pub producer_name: String,
    #[prost(string, tag = "3")]
    pub producer_version: String,
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
    #[prost(message, repeated, tag = "8")]
    pub opset_import: Vec<OperatorSetIdProto>,
    #[prost(message, repeated, tag = "14")]
    pub metadata_props: Vec<StringStringEntryProto>,
}

/// Operator set version declaration.
#[derive(Clone, PartialEq, Message)]
pub struct OperatorSetIdProto {
    #[prost(string, tag = "1")]
    pub domain: String,
    #[prost(int64, tag = "2")]
    pub version: i64,
}

/// Free-form key/value metadata.
#[derive(Clone, PartialEq, Message)]
pub struct StringStringEntryProto {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// A computation graph.
#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "5")]
    pub initializer: Vec<TensorProto>,
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
}

/// A single operator invocation.
#[derive(Clone, PartialEq, Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub op_type: String,
    #[prost(message, repeated, tag = "5")]
    pub attribute: Vec<AttributeProto>,
    #[prost(string, tag = "7")]
    pub domain: String,
}

impl NodeProto {
    /// A node in the default domain without attributes.
    pub fn simple(
        op_type: impl Into<String>,
        name: impl Into<String>,
        input: Vec<String>,
        output: Vec<String>,
    ) -> Self {
        Self::with_attrs(op_type, name, input, output, Vec::new())
    }

    /// A node in the default domain.
    pub fn with_attrs(
        op_type: impl Into<String>,
        name: impl Into<String>,
        input: Vec<String>,
        output: Vec<String>,
        attribute: Vec<AttributeProto>,
    ) -> Self {
        Self {
            input,
            output,
            name: name.into(),
            op_type: op_type.into(),
            attribute,
            domain: String::new(),
        }
    }
}

/// A named operator attribute.
#[derive(Clone, PartialEq, Message)]
pub struct AttributeProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(float, tag = "2")]
    pub f: f32,
    #[prost(int64, tag = "3")]
    pub i: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub s: Vec<u8>,
    #[prost(float, repeated, tag = "7")]
    pub floats: Vec<f32>,
    #[prost(int64, repeated, tag = "8")]
    pub ints: Vec<i64>,
    #[prost(int32, tag = "20")]
    pub r#type: i32,
}

impl AttributeProto {
    fn named(name: impl Into<String>, r#type: i32) -> Self {
        Self {
            name: name.into(),
            r#type,
            ..Default::default()
        }
    }

    pub fn float(name: impl Into<String>, value: f32) -> Self {
        Self {
            f: value,
            ..Self::named(name, attribute_type::FLOAT)
        }
    }

    pub fn int(name: impl Into<String>, value: i64) -> Self {
        Self {
            i: value,
            ..Self::named(name, attribute_type::INT)
        }
    }

    pub fn floats(name: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            floats: values,
            ..Self::named(name, attribute_type::FLOATS)
        }
    }

    pub fn ints(name: impl Into<String>, values: Vec<i64>) -> Self {
        Self {
            ints: values,
            ..Self::named(name, attribute_type::INTS)
        }
    }
}

/// A constant tensor (graph initializer).
#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(int64, repeated, tag = "1")]
    pub dims: Vec<i64>,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(string, tag = "8")]
    pub name: String,
    #[prost(bytes = "vec", tag = "9")]
    pub raw_data: Vec<u8>,
}

impl TensorProto {
    /// An f32 tensor stored as little-endian `raw_data`.
    pub fn float(name: impl Into<String>, dims: Vec<i64>, values: &[f32]) -> Self {
        Self {
            dims,
            data_type: data_type::FLOAT,
            name: name.into(),
            raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Decode `raw_data` back into f32 values.
    pub fn float_values(&self) -> Vec<f32> {
        self.raw_data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

/// Typed tensor name declaration.
#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub r#type: Option<TypeProto>,
}

impl ValueInfoProto {
    /// Create a tensor value info with symbolic/fixed dimensions.
    pub fn tensor(
        name: impl Into<String>,
        elem_type: i32,
        dims: Vec<TensorShapeDimension>,
    ) -> Self {
        Self {
            name: name.into(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(TensorTypeProto {
                    elem_type,
                    shape: Some(TensorShapeProto { dim: dims }),
                })),
            }),
        }
    }

    /// Fixed dimensions of a tensor value info, if it has a tensor type.
    pub fn fixed_dims(&self) -> Option<Vec<i64>> {
        let type_proto::Value::TensorType(t) = self.r#type.as_ref()?.value.as_ref()?;
        t.shape
            .as_ref()?
            .dim
            .iter()
            .map(|d| match d.value {
                Some(tensor_shape_dimension::Value::DimValue(v)) => Some(v),
                _ => None,
            })
            .collect()
    }
}

/// Type of a value (currently only tensor types).
#[derive(Clone, PartialEq, Message)]
pub struct TypeProto {
    #[prost(oneof = "type_proto::Value", tags = "1")]
    pub value: Option<type_proto::Value>,
}

pub mod type_proto {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(message, tag = "1")]
        TensorType(super::TensorTypeProto),
    }
}

/// Tensor type: element data type + shape.
#[derive(Clone, PartialEq, Message)]
pub struct TensorTypeProto {
    #[prost(int32, tag = "1")]
    pub elem_type: i32,
    #[prost(message, optional, tag = "2")]
    pub shape: Option<TensorShapeProto>,
}

/// Tensor shape: a list of dimensions.
#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: Vec<TensorShapeDimension>,
}

/// A single dimension (either a fixed value or a symbolic parameter).
#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeDimension {
    #[prost(oneof = "tensor_shape_dimension::Value", tags = "1, 2")]
    pub value: Option<tensor_shape_dimension::Value>,
}

pub mod tensor_shape_dimension {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(int64, tag = "1")]
        DimValue(i64),
        #[prost(string, tag = "2")]
        DimParam(String),
    }
}

impl TensorShapeDimension {
    /// Create a fixed-size dimension.
    pub fn fixed(size: i64) -> Self {
        Self {
            value: Some(tensor_shape_dimension::Value::DimValue(size)),
        }
    }
}
