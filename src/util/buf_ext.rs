use crate::error::CodecError;

macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> Result<$ty, CodecError> {
            if self.remaining() < size_of::<$ty>() {
                return Err(CodecError::TooShort {
                    needed: size_of::<$ty>(),
                    have: self.remaining(),
                });
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked big-endian reads: running out of data is reported as
///  [CodecError::TooShort] instead of panicking
pub trait BufExt: bytes::Buf {
    get_checked_impl!(get_u8_checked, u8, get_u8);
    get_checked_impl!(get_u16_checked, u16, get_u16);
    get_checked_impl!(get_u32_checked, u32, get_u32);

    fn skip_checked(&mut self, len: usize) -> Result<(), CodecError> {
        if self.remaining() < len {
            return Err(CodecError::TooShort {
                needed: len,
                have: self.remaining(),
            });
        }
        self.advance(len);
        Ok(())
    }
}

impl <T: bytes::Buf> BufExt for T {
}
