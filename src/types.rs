use bincode::{Decode, Encode};

/// Logical column type. Closed set — this engine has no pluggable type system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int,
    Float,
    String,
    Bool,
}

impl DataType {
    /// The tuple_dict slot type_code for this type (I3).
    pub fn type_code(self) -> u8 {
        match self {
            DataType::Int => 0,
            DataType::Float => 1,
            DataType::String => 2,
            DataType::Bool => 3,
        }
    }

    pub fn from_type_code(code: u8) -> Option<DataType> {
        match code {
            0 => Some(DataType::Int),
            1 => Some(DataType::Float),
            2 => Some(DataType::String),
            3 => Some(DataType::Bool),
            _ => None,
        }
    }
}

impl Encode for DataType {
    fn encode<E: bincode::enc::Encoder>(&self, encoder: &mut E) -> Result<(), bincode::error::EncodeError> {
        self.type_code().encode(encoder)
    }
}

impl<Context> Decode<Context> for DataType {
    fn decode<D: bincode::de::Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, bincode::error::DecodeError> {
        let code = u8::decode(decoder)?;
        DataType::from_type_code(code).ok_or(bincode::error::DecodeError::UnexpectedVariant {
            type_name: "DataType",
            allowed: &bincode::error::AllowedEnumVariants::Range { min: 0, max: 3 },
            found: code as u32,
        })
    }
}

/// A single typed cell. `Null` is a distinct variant rather than `Option<Value>`
/// so it can appear wherever a `Value` is expected (row cells, literals, stack
/// slots in the expression evaluator) without an extra layer of wrapping.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
}

impl Value {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(DataType::Int),
            Value::Float(_) => Some(DataType::Float),
            Value::String(_) => Some(DataType::String),
            Value::Bool(_) => Some(DataType::Bool),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Hash contribution per the extendible hash spec (§4.6): integer-type
    /// attributes contribute their integer value, varchar attributes the sum
    /// of their byte values.
    pub fn hash_contribution(&self) -> i64 {
        match self {
            Value::Int(i) => *i,
            Value::String(s) => s.bytes().fold(0i64, |acc, b| acc + b as i64),
            Value::Bool(b) => *b as i64,
            Value::Float(f) => f.to_bits() as i64,
            Value::Null => 0,
        }
    }
}

// Manual Encode/Decode: a one-byte tag followed by the payload, mirroring the
// tagged-union on-disk representation used for block kinds elsewhere.
impl Encode for Value {
    fn encode<E: bincode::enc::Encoder>(&self, encoder: &mut E) -> Result<(), bincode::error::EncodeError> {
        match self {
            Value::Null => 0u8.encode(encoder),
            Value::Int(i) => {
                1u8.encode(encoder)?;
                i.encode(encoder)
            }
            Value::Float(f) => {
                2u8.encode(encoder)?;
                f.encode(encoder)
            }
            Value::String(s) => {
                3u8.encode(encoder)?;
                s.encode(encoder)
            }
            Value::Bool(b) => {
                4u8.encode(encoder)?;
                b.encode(encoder)
            }
        }
    }
}

impl<Context> Decode<Context> for Value {
    fn decode<D: bincode::de::Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, bincode::error::DecodeError> {
        let tag = u8::decode(decoder)?;
        match tag {
            0 => Ok(Value::Null),
            1 => Ok(Value::Int(i64::decode(decoder)?)),
            2 => Ok(Value::Float(f64::decode(decoder)?)),
            3 => Ok(Value::String(String::decode(decoder)?)),
            4 => Ok(Value::Bool(bool::decode(decoder)?)),
            other => Err(bincode::error::DecodeError::UnexpectedVariant {
                type_name: "Value",
                allowed: &bincode::error::AllowedEnumVariants::Range { min: 0, max: 4 },
                found: other as u32,
            }),
        }
    }
}

/// One declared column of a table schema.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

/// Ordered list of columns for a table or a projection result.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Schema { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Case-insensitive lookup, matching the lookup discipline the rest of
    /// the engine uses for attribute names.
    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn restrict(&self, names: &[String]) -> crate::error::Result<Schema> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let idx = self.position_of(name).ok_or_else(|| {
                crate::error::Error::SchemaViolation(format!("unknown attribute: {}", name))
            })?;
            columns.push(self.columns[idx].clone());
        }
        Ok(Schema::new(columns))
    }
}

/// A horizontal slice of a table row: one `Value` per column, in schema order.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Row { values }
    }

    pub fn get(&self, i: usize) -> Option<&Value> {
        self.values.get(i)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn project(&self, schema: &Schema, names: &[String]) -> crate::error::Result<Row> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let idx = schema.position_of(name).ok_or_else(|| {
                crate::error::Error::SchemaViolation(format!("unknown attribute: {}", name))
            })?;
            out.push(self.values[idx].clone());
        }
        Ok(Row::new(out))
    }
}
