use core::fmt;

/// Numeric type a buffer's bytes are interpreted as.
///
/// The tag is recorded when a buffer is created and travels with it; a view of a different type
/// can be taken for reading, but only a view of the recorded type may be handed to the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    U8 = 0,
    I8 = 1,
    U8Clamped = 2,
    U16 = 3,
    I16 = 4,
    U32 = 5,
    I32 = 6,
    F32 = 7,
    F64 = 8,
    U64 = 9,
    I64 = 10,
}

impl ElementType {
    pub const fn byte_size(self) -> u32 {
        match self {
            ElementType::U8 | ElementType::I8 | ElementType::U8Clamped => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::F64 | ElementType::U64 | ElementType::I64 => 8,
        }
    }

    pub const fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => ElementType::U8,
            1 => ElementType::I8,
            2 => ElementType::U8Clamped,
            3 => ElementType::U16,
            4 => ElementType::I16,
            5 => ElementType::U32,
            6 => ElementType::I32,
            7 => ElementType::F32,
            8 => ElementType::F64,
            9 => ElementType::U64,
            10 => ElementType::I64,
            _ => return None,
        })
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::U8 => "u8",
            ElementType::I8 => "i8",
            ElementType::U8Clamped => "u8-clamped",
            ElementType::U16 => "u16",
            ElementType::I16 => "i16",
            ElementType::U32 => "u32",
            ElementType::I32 => "i32",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::U64 => "u64",
            ElementType::I64 => "i64",
        };
        f.write_str(name)
    }
}
