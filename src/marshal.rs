//! Little-endian encoder/decoder for fixed-size on-disk records.

use byteorder::{ByteOrder, LittleEndian};

/// Encoder for a record of a fixed target size; `finish` zero-pads.
pub struct Enc {
    buf: Vec<u8>,
    sz: usize,
}

impl Enc {
    pub fn new(sz: usize) -> Enc {
        Enc {
            buf: Vec::with_capacity(sz),
            sz,
        }
    }

    pub fn put_int(&mut self, x: u64) {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, x);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_u32(&mut self, x: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, x);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn finish(mut self) -> Vec<u8> {
        assert!(self.buf.len() <= self.sz, "record overflow");
        self.buf.resize(self.sz, 0);
        self.buf
    }
}

/// Decoder over a byte slice.
pub struct Dec<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Dec<'a> {
    pub fn new(buf: &'a [u8]) -> Dec<'a> {
        Dec { buf, off: 0 }
    }

    pub fn get_int(&mut self) -> u64 {
        let x = LittleEndian::read_u64(&self.buf[self.off..self.off + 8]);
        self.off += 8;
        x
    }

    pub fn get_u32(&mut self) -> u32 {
        let x = LittleEndian::read_u32(&self.buf[self.off..self.off + 4]);
        self.off += 4;
        x
    }

    pub fn get_bytes(&mut self, n: usize) -> &'a [u8] {
        let b = &self.buf[self.off..self.off + n];
        self.off += n;
        b
    }
}
