pub mod codec;
pub mod descriptor;
pub mod header;

pub use codec::{
    child_page_no, compare_with_key, decode_fields, decode_offsets, encode, encoded_size,
    nth_field, read_var_len, validate, EncodedSize, FieldSlot, FieldValue, RecordOffsets,
};
pub use descriptor::{DescriptorBuilder, FieldDesc, FieldType, RecordDescriptor, RecordFormat};
pub use header::{RecordHeader, RecordStatus, COMPACT_HEADER_SIZE, ORIGINAL_HEADER_SIZE};
