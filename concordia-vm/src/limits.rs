/// Fixed-size tunables for the no-allocation execution path (spec.md §3's
/// "small operand stack... small struct-scope stack", sized here the way
/// the teacher's `consts.rs` names its tunables instead of burying them as
/// magic numbers at the call site).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum depth of the expression evaluator's operand stack.
    pub max_expr_stack: usize,
    /// Maximum depth of nested `ENTER_STRUCT` scopes.
    pub max_struct_depth: usize,
    /// Maximum length, in bytes, accepted for any string field.
    pub max_string_len: usize,
    /// Maximum depth of nested `CRC_BEGIN` regions.
    pub max_crc_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_expr_stack: 32, max_struct_depth: 16, max_string_len: 4096, max_crc_depth: 4 }
    }
}
