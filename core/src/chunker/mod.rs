//! Content-defined chunking with a Rabin fingerprint over a sliding window.
//!
//! Boundaries depend only on the last [`WINDOW_SIZE`] bytes and the distance
//! to the previous boundary, so an edit in one region of a stream leaves the
//! chunks of unrelated regions untouched.

mod polynomial;

pub use polynomial::{POLYNOMIAL_DEGREE, Pol};

use crate::{Error, Id, Result};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};

pub const WINDOW_SIZE: usize = 64;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;
const READ_BUFFER_SIZE: usize = 512 * KIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerParams {
    pub min_size: usize,
    pub avg_size: usize,
    pub max_size: usize,
}

impl Default for ChunkerParams {
    fn default() -> Self {
        Self {
            min_size: 512 * KIB,
            avg_size: MIB,
            max_size: 8 * MIB,
        }
    }
}

impl ChunkerParams {
    pub fn new(min_size: usize, avg_size: usize, max_size: usize) -> Result<Self> {
        let params = Self {
            min_size,
            avg_size,
            max_size,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_size < WINDOW_SIZE {
            return Err(Error::Config(format!(
                "minimum chunk size {} is below the window size {}",
                self.min_size, WINDOW_SIZE
            )));
        }
        if !self.avg_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "average chunk size {} is not a power of two",
                self.avg_size
            )));
        }
        if self.avg_size.trailing_zeros() as i32 > POLYNOMIAL_DEGREE - 8 {
            return Err(Error::Config(format!(
                "average chunk size {} is too large",
                self.avg_size
            )));
        }
        if self.min_size > self.avg_size || self.avg_size > self.max_size {
            return Err(Error::Config(format!(
                "chunk sizes must satisfy min <= avg <= max (got {}/{}/{})",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        Ok(())
    }

    fn split_mask(&self) -> u64 {
        (1u64 << self.avg_size.trailing_zeros()) - 1
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub length: usize,
    pub data: Vec<u8>,
    /// Fingerprint at the cut point.
    pub cut: u64,
}

impl Chunk {
    pub fn id(&self) -> Id {
        Id::from_data(&self.data)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

struct Tables {
    out: [u64; 256],
    reduce: [u64; 256],
}

impl Tables {
    fn new(pol: Pol) -> Self {
        let mut out = [0u64; 256];
        let mut reduce = [0u64; 256];

        // out[b] is the fingerprint of b followed by WINDOW_SIZE - 1 zero bytes;
        // adding it cancels b when it leaves the window.
        for (b, slot) in out.iter_mut().enumerate() {
            let mut h = append_byte(Pol::new(0), b as u8, pol);
            for _ in 0..WINDOW_SIZE - 1 {
                h = append_byte(h, 0, pol);
            }
            *slot = h.value();
        }

        // reduce[b] clears the 8 bits shifted above deg(pol) and adds their residue.
        let k = pol.deg();
        for (b, slot) in reduce.iter_mut().enumerate() {
            let shifted = (b as u64) << k;
            *slot = Pol::new(shifted).modulo(pol).value() | shifted;
        }

        Self { out, reduce }
    }
}

fn append_byte(hash: Pol, b: u8, pol: Pol) -> Pol {
    Pol::new((hash.value() << 8) | b as u64).modulo(pol)
}

/// Lazily splits a reader into chunks. Call [`Chunker::reset`] to reuse the
/// tables for another stream.
pub struct Chunker<R> {
    reader: R,
    params: ChunkerParams,
    split_mask: u64,
    pol_shift: u32,
    tables: Tables,

    buf: Vec<u8>,
    bpos: usize,
    bmax: usize,
    eof: bool,

    window: [u8; WINDOW_SIZE],
    wpos: usize,
    digest: u64,
    pos: u64,
}

/// A chunking polynomial must be irreducible and of degree [`POLYNOMIAL_DEGREE`].
pub fn validate_polynomial(pol: Pol) -> Result<()> {
    if pol.deg() != POLYNOMIAL_DEGREE {
        return Err(Error::Config(format!(
            "polynomial {pol} has degree {}, expected {POLYNOMIAL_DEGREE}",
            pol.deg()
        )));
    }
    if !pol.is_irreducible() {
        return Err(Error::Config(format!("polynomial {pol} is not irreducible")));
    }
    Ok(())
}

impl<R: Read> Chunker<R> {
    pub fn new(reader: R, pol: Pol, params: ChunkerParams) -> Result<Self> {
        params.validate()?;
        validate_polynomial(pol)?;
        Ok(Self {
            reader,
            params,
            split_mask: params.split_mask(),
            pol_shift: (pol.deg() - 8) as u32,
            tables: Tables::new(pol),
            buf: vec![0u8; READ_BUFFER_SIZE],
            bpos: 0,
            bmax: 0,
            eof: false,
            window: [0u8; WINDOW_SIZE],
            wpos: 0,
            digest: 0,
            pos: 0,
        })
    }

    pub fn reset(&mut self, reader: R) {
        self.reader = reader;
        self.bpos = 0;
        self.bmax = 0;
        self.eof = false;
        self.pos = 0;
    }

    pub fn params(&self) -> ChunkerParams {
        self.params
    }

    fn reset_window(&mut self) {
        self.window = [0u8; WINDOW_SIZE];
        self.wpos = 0;
        self.digest = 0;
        self.slide(1);
    }

    fn slide(&mut self, b: u8) {
        let out = self.window[self.wpos];
        self.window[self.wpos] = b;
        self.digest ^= self.tables.out[out as usize];
        self.wpos = (self.wpos + 1) % WINDOW_SIZE;

        let index = (self.digest >> self.pol_shift) as usize;
        self.digest <<= 8;
        self.digest |= b as u64;
        self.digest ^= self.tables.reduce[index];
    }

    fn fill(&mut self) -> Result<usize> {
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(n) => {
                    self.bpos = 0;
                    self.bmax = n;
                    if n == 0 {
                        self.eof = true;
                    }
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn finish(&mut self, data: Vec<u8>) -> Chunk {
        let chunk = Chunk {
            offset: self.pos,
            length: data.len(),
            data,
            cut: self.digest,
        };
        self.pos += chunk.length as u64;
        chunk
    }

    /// Next chunk of the stream, `None` once the reader is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.eof {
            return Ok(None);
        }
        self.reset_window();

        let min = self.params.min_size;
        let max = self.params.max_size;
        let mut data = Vec::with_capacity(min);
        // The first bytes can never produce a cut, only the window before `min` matters.
        let mut skip = min - WINDOW_SIZE;

        loop {
            if self.bpos >= self.bmax && self.fill()? == 0 {
                if data.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.finish(data)));
            }

            if skip > 0 {
                let n = skip.min(self.bmax - self.bpos);
                data.extend_from_slice(&self.buf[self.bpos..self.bpos + n]);
                self.bpos += n;
                skip -= n;
                continue;
            }

            let start = self.bpos;
            let mut i = start;
            while i < self.bmax {
                let b = self.buf[i];
                self.slide(b);
                i += 1;

                let len = data.len() + (i - start);
                if len >= min && ((self.digest & self.split_mask) == 0 || len >= max) {
                    data.extend_from_slice(&self.buf[start..i]);
                    self.bpos = i;
                    return Ok(Some(self.finish(data)));
                }
            }
            data.extend_from_slice(&self.buf[start..self.bmax]);
            self.bpos = self.bmax;
        }
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

/// Chunks an in-memory buffer.
pub fn chunk_data(data: &[u8], pol: Pol, params: ChunkerParams) -> Result<Vec<Chunk>> {
    Chunker::new(data, pol, params)?.collect()
}
