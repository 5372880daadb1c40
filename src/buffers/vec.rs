use super::writer::{DidntWrite, HasWriter, Writer};

impl HasWriter for &mut Vec<u8> {
    type Writer = Self;

    fn writer(self) -> Self::Writer {
        self
    }
}

impl Writer for &mut Vec<u8> {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, DidntWrite> {
        if bytes.is_empty() {
            return Err(DidntWrite);
        }
        self.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn write_exact(&mut self, bytes: &[u8]) -> Result<(), DidntWrite> {
        self.extend_from_slice(bytes);
        Ok(())
    }

    fn write_u8(&mut self, byte: u8) -> Result<(), DidntWrite> {
        self.push(byte);
        Ok(())
    }

    fn remaining(&self) -> usize {
        usize::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_writer() {
        let mut buf: Vec<u8> = Vec::new();
        let mut writer = buf.writer();
        writer.write_u8(1).unwrap();
        writer.write_exact(&[2, 3]).unwrap();
        assert_eq!(writer.write(&[4]).unwrap(), 1);
        assert!(writer.write(&[]).is_err());
        assert!(writer.can_write());
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
