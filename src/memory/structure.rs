//! Structure layouts
//!
//! A [`StructDef`] is a named table of [`FieldDescriptor`]s describing how
//! an OS data structure sits in guest memory. Structured regions use it to
//! annotate accesses with the field they touch; the bytes themselves still
//! live in the region's flat buffer.

use super::Width;
use crate::error::{BridgeError, BridgeResult};
use serde::Serialize;

/// Interpretation applied to a raw field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueConversion {
    /// Two's complement at the field's width
    Signed,
    /// BCPL pointer: longword index, byte address is value * 4
    BcplPointer,
}

impl ValueConversion {
    pub fn apply(self, raw: u32, width: u32) -> i64 {
        match self {
            ValueConversion::Signed => match width {
                1 => raw as u8 as i8 as i64,
                2 => raw as u16 as i16 as i64,
                _ => raw as i32 as i64,
            },
            ValueConversion::BcplPointer => (raw as i64) << 2,
        }
    }
}

/// One named field of a structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    /// Byte offset from the structure origin
    pub offset: u32,
    /// Declared width in bytes
    pub width: u32,
    pub conversion: Option<ValueConversion>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, offset: u32, width: u32) -> Self {
        Self {
            name: name.into(),
            offset,
            width,
            conversion: None,
        }
    }

    pub fn with_conversion(mut self, conversion: ValueConversion) -> Self {
        self.conversion = Some(conversion);
        self
    }

    /// Scalar access width, if the field is 1, 2 or 4 bytes wide
    pub fn access_width(&self) -> Option<Width> {
        Width::from_bytes(self.width)
    }

    fn end(&self) -> u32 {
        self.offset + self.width
    }
}

/// Result of an offset-to-field lookup
#[derive(Debug, Clone, Copy)]
pub struct FieldHit<'a> {
    pub field: &'a FieldDescriptor,
    /// Offset of the access inside the field
    pub delta: u32,
}

/// A validated structure layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDef {
    name: String,
    size: u32,
    /// Sorted by offset, non-overlapping
    fields: Vec<FieldDescriptor>,
}

impl StructDef {
    /// Build a layout from explicit descriptors.
    ///
    /// Fails with `MalformedStructure` on duplicate names, duplicate or
    /// overlapping offsets, zero widths, or fields beyond `size`.
    pub fn new(
        name: impl Into<String>,
        size: u32,
        mut fields: Vec<FieldDescriptor>,
    ) -> BridgeResult<Self> {
        let name = name.into();
        let malformed = |reason: String| BridgeError::MalformedStructure {
            name: name.clone(),
            reason,
        };

        fields.sort_by_key(|f| f.offset);

        let mut prev_end = 0u32;
        for (i, field) in fields.iter().enumerate() {
            if field.width == 0 {
                return Err(malformed(format!("field '{}' has zero width", field.name)));
            }
            let end = field
                .offset
                .checked_add(field.width)
                .ok_or_else(|| malformed(format!("field '{}' overflows", field.name)))?;
            if end > size {
                return Err(malformed(format!(
                    "field '{}' [{}, {}) exceeds size {}",
                    field.name, field.offset, end, size
                )));
            }
            if i > 0 && field.offset < prev_end {
                return Err(malformed(format!(
                    "field '{}' at offset {} overlaps '{}'",
                    field.name,
                    field.offset,
                    fields[i - 1].name
                )));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(malformed(format!("duplicate field name '{}'", field.name)));
            }
            prev_end = end;
        }

        Ok(Self { name, size, fields })
    }

    /// Sequential layout builder
    pub fn builder(name: impl Into<String>) -> StructBuilder {
        StructBuilder {
            name: name.into(),
            offset: 0,
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field covering `offset`; gaps and offsets past the end give None
    pub fn field_at(&self, offset: u32) -> Option<FieldHit<'_>> {
        if offset >= self.size {
            return None;
        }
        let idx = self.fields.partition_point(|f| f.offset <= offset);
        let field = self.fields.get(idx.checked_sub(1)?)?;
        (offset < field.end()).then(|| FieldHit {
            field,
            delta: offset - field.offset,
        })
    }
}

/// Lays out fields back to back, the way OS headers declare them
#[derive(Debug)]
pub struct StructBuilder {
    name: String,
    offset: u32,
    fields: Vec<FieldDescriptor>,
}

impl StructBuilder {
    pub fn field(mut self, name: &str, width: u32) -> Self {
        self.fields.push(FieldDescriptor::new(name, self.offset, width));
        self.offset += width;
        self
    }

    pub fn signed(mut self, name: &str, width: u32) -> Self {
        self.fields.push(
            FieldDescriptor::new(name, self.offset, width).with_conversion(ValueConversion::Signed),
        );
        self.offset += width;
        self
    }

    pub fn bptr(mut self, name: &str) -> Self {
        self.fields.push(
            FieldDescriptor::new(name, self.offset, 4)
                .with_conversion(ValueConversion::BcplPointer),
        );
        self.offset += 4;
        self
    }

    /// Inline another structure, prefixing its field names with `prefix.`
    pub fn embed(mut self, prefix: &str, inner: &StructDef) -> Self {
        for f in inner.fields() {
            let mut field = f.clone();
            field.name = format!("{prefix}.{}", f.name);
            field.offset += self.offset;
            self.fields.push(field);
        }
        self.offset += inner.size();
        self
    }

    /// Leave an unnamed gap
    pub fn pad(mut self, bytes: u32) -> Self {
        self.offset += bytes;
        self
    }

    pub fn build(self) -> BridgeResult<StructDef> {
        StructDef::new(self.name, self.offset, self.fields)
    }
}

/// Exec layouts used by the bridge itself
pub mod layouts {
    use super::StructDef;
    use crate::error::BridgeResult;

    pub fn node() -> BridgeResult<StructDef> {
        StructDef::builder("Node")
            .field("ln_Succ", 4)
            .field("ln_Pred", 4)
            .field("ln_Type", 1)
            .signed("ln_Pri", 1)
            .field("ln_Name", 4)
            .build()
    }

    pub fn list() -> BridgeResult<StructDef> {
        StructDef::builder("List")
            .field("lh_Head", 4)
            .field("lh_Tail", 4)
            .field("lh_TailPred", 4)
            .field("lh_Type", 1)
            .field("l_pad", 1)
            .build()
    }

    pub fn library() -> BridgeResult<StructDef> {
        StructDef::builder("Library")
            .embed("lib_Node", &node()?)
            .field("lib_Flags", 1)
            .field("lib_pad", 1)
            .field("lib_NegSize", 2)
            .field("lib_PosSize", 2)
            .field("lib_Version", 2)
            .field("lib_Revision", 2)
            .field("lib_IdString", 4)
            .field("lib_Sum", 4)
            .field("lib_OpenCnt", 2)
            .build()
    }

    pub fn task() -> BridgeResult<StructDef> {
        StructDef::builder("Task")
            .embed("tc_Node", &node()?)
            .field("tc_Flags", 1)
            .field("tc_State", 1)
            .signed("tc_IDNestCnt", 1)
            .signed("tc_TDNestCnt", 1)
            .field("tc_SigAlloc", 4)
            .field("tc_SigWait", 4)
            .field("tc_SigRecvd", 4)
            .field("tc_SigExcept", 4)
            .field("tc_TrapAlloc", 2)
            .field("tc_TrapAble", 2)
            .field("tc_ExceptData", 4)
            .field("tc_ExceptCode", 4)
            .field("tc_TrapData", 4)
            .field("tc_TrapCode", 4)
            .field("tc_SPReg", 4)
            .field("tc_SPLower", 4)
            .field("tc_SPUpper", 4)
            .field("tc_Switch", 4)
            .field("tc_Launch", 4)
            .embed("tc_MemEntry", &list()?)
            .field("tc_UserData", 4)
            .build()
    }

    /// The slice of ExecBase the scheduler mirror maintains
    pub fn exec_lists() -> BridgeResult<StructDef> {
        StructDef::builder("ExecLists")
            .field("ThisTask", 4)
            .embed("TaskReady", &list()?)
            .embed("TaskWait", &list()?)
            .build()
    }
}
