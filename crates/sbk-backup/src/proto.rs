//! Wire messages of the backup container.
//!
//! Field numbers and proto2 presence semantics are fixed by the format;
//! existing backups must stay readable. Application code works with
//! [`crate::frame::BackupFrame`] rather than these messages.

#[derive(Clone, PartialEq, prost::Message)]
pub struct SqlParameter {
    // the misspelling is part of the format's field naming
    #[prost(string, optional, tag = "1")]
    pub string_paramter: Option<String>,
    /// Signed 64-bit cells travel as their two's-complement bit pattern
    #[prost(uint64, optional, tag = "2")]
    pub integer_parameter: Option<u64>,
    #[prost(double, optional, tag = "3")]
    pub double_parameter: Option<f64>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub blob_parameter: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "5")]
    pub nullparameter: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SqlStatement {
    #[prost(string, optional, tag = "1")]
    pub statement: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub parameters: Vec<SqlParameter>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SharedPreference {
    #[prost(string, optional, tag = "1")]
    pub file: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub key: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub value: Option<String>,
    #[prost(bool, optional, tag = "4")]
    pub boolean_value: Option<bool>,
    #[prost(string, repeated, tag = "5")]
    pub string_set_value: Vec<String>,
    #[prost(bool, optional, tag = "6")]
    pub is_string_set_value: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Attachment {
    #[prost(uint64, optional, tag = "1")]
    pub row_id: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub attachment_id: Option<u64>,
    #[prost(uint32, optional, tag = "3")]
    pub length: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Sticker {
    #[prost(uint64, optional, tag = "1")]
    pub row_id: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    pub length: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Avatar {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub recipient_id: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub length: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DatabaseVersion {
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub iv: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub salt: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyValue {
    #[prost(string, optional, tag = "1")]
    pub key: Option<String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub blob_value: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "3")]
    pub boolean_value: Option<bool>,
    #[prost(float, optional, tag = "4")]
    pub float_value: Option<f32>,
    #[prost(int32, optional, tag = "5")]
    pub integer_value: Option<i32>,
    #[prost(int64, optional, tag = "6")]
    pub long_value: Option<i64>,
    #[prost(string, optional, tag = "7")]
    pub string_value: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BackupFrame {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(message, optional, tag = "2")]
    pub statement: Option<SqlStatement>,
    #[prost(message, optional, tag = "3")]
    pub preference: Option<SharedPreference>,
    #[prost(message, optional, tag = "4")]
    pub attachment: Option<Attachment>,
    #[prost(message, optional, tag = "5")]
    pub version: Option<DatabaseVersion>,
    #[prost(bool, optional, tag = "6")]
    pub end: Option<bool>,
    #[prost(message, optional, tag = "7")]
    pub avatar: Option<Avatar>,
    #[prost(message, optional, tag = "8")]
    pub sticker: Option<Sticker>,
    #[prost(message, optional, tag = "9")]
    pub key_value: Option<KeyValue>,
}
