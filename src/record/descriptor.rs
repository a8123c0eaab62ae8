use std::sync::Arc;

/// Physical column types known to the record codec. The codec only needs
/// enough typing to lay bytes out; value semantics live above the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// 8-bit integer: 1 byte
    TinyInt,
    /// 16-bit integer: 2 bytes
    SmallInt,
    /// 32-bit integer: 4 bytes
    Int,
    /// 64-bit integer: 8 bytes
    BigInt,
    /// Fixed-length binary/character data: exactly n bytes
    FixedBinary(u16),
    /// Variable-length binary/character data: up to n bytes
    VarBinary(u16),
}

impl FieldType {
    /// Returns the fixed size in bytes, or None for variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            FieldType::TinyInt => Some(1),
            FieldType::SmallInt => Some(2),
            FieldType::Int => Some(4),
            FieldType::BigInt => Some(8),
            FieldType::FixedBinary(n) => Some(*n as usize),
            FieldType::VarBinary(_) => None,
        }
    }

    /// Declared maximum data length in bytes.
    pub fn max_len(&self) -> usize {
        match self {
            FieldType::VarBinary(n) => *n as usize,
            _ => self.fixed_size().unwrap(),
        }
    }

    pub fn is_fixed(&self) -> bool {
        !matches!(self, FieldType::VarBinary(_))
    }
}

/// Physical record format selector carried by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    /// Compact format: reverse-order length prefixes + null bitmap +
    /// 5-byte header.
    Compact,
    /// Original format: per-field end-offset table + 6-byte header.
    Original,
}

/// Describes one field of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    /// Field type code
    field_type: FieldType,
    /// Whether the field may be NULL
    nullable: bool,
    /// Whether the field is part of the primary key
    key_member: bool,
    /// Position in the descriptor (0-indexed)
    ordinal: usize,
}

impl FieldDesc {
    pub fn new(field_type: FieldType, nullable: bool, key_member: bool) -> Self {
        Self {
            field_type,
            nullable,
            key_member,
            ordinal: 0, // assigned by RecordDescriptor
        }
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_key_member(&self) -> bool {
        self.key_member
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Fixed length in bytes, zero for variable-length fields.
    pub fn fixed_len(&self) -> usize {
        self.field_type.fixed_size().unwrap_or(0)
    }

    /// Declared maximum data length.
    pub fn max_len(&self) -> usize {
        self.field_type.max_len()
    }

    pub fn is_variable(&self) -> bool {
        !self.field_type.is_fixed()
    }
}

/// Immutable description of a record's columns. Built once, shared via Arc,
/// never mutated while records encoded under it exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDescriptor {
    fields: Vec<FieldDesc>,
    format: RecordFormat,
    /// Number of nullable fields
    nullable_count: usize,
    /// Per-field index into the null bitmap (None for NOT NULL fields)
    null_positions: Vec<Option<usize>>,
    /// Sum of fixed-length field sizes
    fixed_size: usize,
    /// Number of variable-length fields
    variable_count: usize,
    /// Number of leading key-member fields
    key_field_count: usize,
}

impl RecordDescriptor {
    pub fn new(fields: Vec<FieldDesc>, format: RecordFormat) -> Self {
        let mut fields = fields;
        let mut nullable_count = 0;
        let mut null_positions = Vec::with_capacity(fields.len());
        let mut fixed_size = 0;
        let mut variable_count = 0;
        let mut key_field_count = 0;

        for (i, f) in fields.iter_mut().enumerate() {
            f.ordinal = i;
            if f.nullable {
                null_positions.push(Some(nullable_count));
                nullable_count += 1;
            } else {
                null_positions.push(None);
            }
            if let Some(size) = f.field_type.fixed_size() {
                fixed_size += size;
            } else {
                variable_count += 1;
            }
            if f.key_member {
                key_field_count += 1;
            }
        }

        Self {
            fields,
            format,
            nullable_count,
            null_positions,
            fixed_size,
            variable_count,
            key_field_count,
        }
    }

    pub fn builder() -> DescriptorBuilder {
        DescriptorBuilder::new()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, index: usize) -> Option<&FieldDesc> {
        self.fields.get(index)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDesc> {
        self.fields.iter()
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    pub fn nullable_count(&self) -> usize {
        self.nullable_count
    }

    /// Index of a field's bit in the null bitmap, None for NOT NULL fields.
    pub fn null_position(&self, index: usize) -> Option<usize> {
        self.null_positions.get(index).copied().flatten()
    }

    /// Size of the null bitmap in bytes: ceil(nullable_count / 8).
    pub fn null_bitmap_size(&self) -> usize {
        (self.nullable_count + 7) / 8
    }

    pub fn fixed_size(&self) -> usize {
        self.fixed_size
    }

    pub fn variable_count(&self) -> usize {
        self.variable_count
    }

    /// Number of leading key-member fields (the unique prefix).
    pub fn key_field_count(&self) -> usize {
        self.key_field_count
    }

    /// Indices of key-member fields in definition order.
    pub fn key_field_indices(&self) -> Vec<usize> {
        self.fields
            .iter()
            .filter(|f| f.key_member)
            .map(|f| f.ordinal)
            .collect()
    }
}

/// Builder for constructing record descriptors fluently.
pub struct DescriptorBuilder {
    fields: Vec<FieldDesc>,
    format: RecordFormat,
}

impl DescriptorBuilder {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            format: RecordFormat::Compact,
        }
    }

    /// Adds a NOT NULL field.
    pub fn field(mut self, field_type: FieldType) -> Self {
        self.fields.push(FieldDesc::new(field_type, false, false));
        self
    }

    /// Adds a nullable field.
    pub fn nullable_field(mut self, field_type: FieldType) -> Self {
        self.fields.push(FieldDesc::new(field_type, true, false));
        self
    }

    /// Adds a NOT NULL primary-key field.
    pub fn key_field(mut self, field_type: FieldType) -> Self {
        self.fields.push(FieldDesc::new(field_type, false, true));
        self
    }

    /// Selects the physical format (compact by default).
    pub fn format(mut self, format: RecordFormat) -> Self {
        self.format = format;
        self
    }

    pub fn build(self) -> RecordDescriptor {
        RecordDescriptor::new(self.fields, self.format)
    }

    pub fn build_arc(self) -> Arc<RecordDescriptor> {
        Arc::new(self.build())
    }
}

impl Default for DescriptorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_desc() -> RecordDescriptor {
        RecordDescriptor::builder()
            .key_field(FieldType::Int)
            .field(FieldType::VarBinary(100))
            .nullable_field(FieldType::VarBinary(200))
            .field(FieldType::SmallInt)
            .build()
    }

    #[test]
    fn test_descriptor_counts() {
        let desc = test_desc();
        assert_eq!(desc.field_count(), 4);
        assert_eq!(desc.nullable_count(), 1);
        assert_eq!(desc.null_bitmap_size(), 1);
        // Fixed: id (4) + smallint (2) = 6
        assert_eq!(desc.fixed_size(), 6);
        assert_eq!(desc.variable_count(), 2);
        assert_eq!(desc.key_field_count(), 1);
        assert_eq!(desc.key_field_indices(), vec![0]);
    }

    #[test]
    fn test_null_positions() {
        let desc = RecordDescriptor::builder()
            .nullable_field(FieldType::Int)
            .field(FieldType::Int)
            .nullable_field(FieldType::Int)
            .build();
        assert_eq!(desc.null_position(0), Some(0));
        assert_eq!(desc.null_position(1), None);
        assert_eq!(desc.null_position(2), Some(1));
    }

    #[test]
    fn test_ordinals_assigned() {
        let desc = test_desc();
        for (i, f) in desc.fields().enumerate() {
            assert_eq!(f.ordinal(), i);
        }
    }

    #[test]
    fn test_bitmap_rounding() {
        let mut b = RecordDescriptor::builder();
        for _ in 0..9 {
            b = b.nullable_field(FieldType::TinyInt);
        }
        let desc = b.build();
        assert_eq!(desc.nullable_count(), 9);
        assert_eq!(desc.null_bitmap_size(), 2);
    }
}
