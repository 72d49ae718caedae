/// Primitive number types whose alignment is at least 4 bytes.
///
/// Receive buffers are backed by one of these so every `f32`/`u32` section that
/// starts on a 4 byte offset of a frame can be viewed in place.
pub trait Align4: bytemuck::Pod {}

impl Align4 for u32 {}
impl Align4 for i32 {}
impl Align4 for u64 {}
impl Align4 for i64 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
