use super::reader::{AdvanceableReader, DidntRead, Reader};

impl Reader for &[u8] {
    fn read(&mut self, into: &mut [u8]) -> Result<usize, DidntRead> {
        let len = self.len().min(into.len());
        if len == 0 {
            return Err(DidntRead);
        }
        let (to_read, remain) = self.split_at(len);
        into[..len].copy_from_slice(to_read);
        *self = remain;
        Ok(len)
    }

    fn read_exact(&mut self, into: &mut [u8]) -> Result<(), DidntRead> {
        if self.len() < into.len() {
            return Err(DidntRead);
        }
        let (to_read, remain) = self.split_at(into.len());
        into.copy_from_slice(to_read);
        *self = remain;
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, DidntRead> {
        let (&byte, remain) = self.split_first().ok_or(DidntRead)?;
        *self = remain;
        Ok(byte)
    }

    fn remaining(&self) -> usize {
        self.len()
    }

    fn can_read(&self) -> bool {
        !self.is_empty()
    }
}

impl AdvanceableReader for &[u8] {
    fn skip(&mut self, offset: usize) -> Result<(), DidntRead> {
        if self.len() < offset {
            return Err(DidntRead);
        }
        *self = &self[offset..];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_reader() {
        let mut reader: &[u8] = &[1, 2, 3, 4, 5];
        assert_eq!(reader.read_u8().unwrap(), 1);

        let mut out = [0u8; 2];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, [2, 3]);
        assert_eq!(reader.remaining(), 2);

        reader.skip(1).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 5);
        assert!(!reader.can_read());
        assert!(reader.read_u8().is_err());
        assert!(reader.skip(1).is_err());
    }
}
