pub(crate) mod amqp;
pub(crate) mod annotations;
pub(crate) mod compose;

pub use annotations::{
    ANNOTATIONS_VERSION, ANNOTATIONS_VERSION_KEY, AnnotationsError, RouterAnnotations,
    negotiated_version, ra_flags,
};
pub use compose::{Composer, Performative, data_section_bytes};

use crate::buffers::{
    reader::{DidntRead, Reader},
    writer::{DidntWrite, Writer},
};

pub(crate) trait WCodec<Message, Buffer> {
    type Output;
    fn write(self, buffer: Buffer, message: Message) -> Self::Output;
}

pub(crate) trait RCodec<Message, Buffer> {
    type Error;
    fn read(self, buffer: Buffer) -> Result<Message, Self::Error>;
}

/// AMQP 1.0 primitive codec. All multi-octet values are network order.
#[derive(Clone, Copy)]
pub(crate) struct AmqpCodec;

impl AmqpCodec {
    pub(crate) const fn new() -> Self {
        Self
    }
}

macro_rules! impl_fixed {
    ($ty:ty) => {
        impl<W> WCodec<$ty, &mut W> for AmqpCodec
        where
            W: Writer,
        {
            type Output = Result<(), DidntWrite>;

            fn write(self, writer: &mut W, x: $ty) -> Self::Output {
                writer.write_exact(&x.to_be_bytes())
            }
        }

        impl<R> RCodec<$ty, &mut R> for AmqpCodec
        where
            R: Reader,
        {
            type Error = DidntRead;

            fn read(self, reader: &mut R) -> Result<$ty, Self::Error> {
                let mut bytes = [0u8; size_of::<$ty>()];
                reader.read_exact(&mut bytes)?;
                Ok(<$ty>::from_be_bytes(bytes))
            }
        }
    };
}

impl_fixed!(u8);
impl_fixed!(u16);
impl_fixed!(u32);
impl_fixed!(u64);
impl_fixed!(i32);
impl_fixed!(i64);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::writer::HasWriter;

    #[test]
    fn test_fixed_roundtrip() {
        let codec = AmqpCodec::new();

        macro_rules! run {
            ($ty:ty, $val:expr) => {
                let mut buf = vec![];
                let mut writer = buf.writer();
                codec.write(&mut writer, $val as $ty).unwrap();
                assert_eq!(buf.len(), size_of::<$ty>());

                let mut reader = buf.as_slice();
                let back: $ty = codec.read(&mut reader).unwrap();
                assert_eq!(back, $val as $ty);
                assert!(!reader.can_read());
            };
        }

        run!(u8, 0x7F);
        run!(u16, 0xBEEF);
        run!(u32, 0xDEADBEEFu32);
        run!(u64, 0x0102030405060708u64);
        run!(i32, -42);
        run!(i64, -1);
    }

    #[test]
    fn test_network_order() {
        let codec = AmqpCodec::new();
        let mut buf = vec![];
        let mut writer = buf.writer();
        codec.write(&mut writer, 0x0102u16).unwrap();
        assert_eq!(buf, [0x01, 0x02]);
    }
}
