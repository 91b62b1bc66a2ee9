// Number types that can be viewed as raw bytes.
pub trait Align1: bytemuck::Pod {}

impl Align1 for u8 {}
impl Align1 for u32 {}
impl Align1 for u64 {}
impl Align1 for f32 {}
impl Align1 for f64 {}

// Number types whose alignment is at least 4 bytes, so a byte buffer made of them can
// be reinterpreted as `f32`s after a 4 byte header.
pub trait Align4: Align1 {}

impl Align4 for u32 {}
impl Align4 for u64 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
