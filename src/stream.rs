//! Sequential reading and writing of primitives into a fixed byte buffer.
//!
//! [`Stream`] is the single wire-format seam of the crate: packet headers,
//! message headers and message bodies all (de)serialize through it. A stream
//! is constructed in either [`StreamMode::Read`] or [`StreamMode::Write`] and
//! keeps that mode for its lifetime; [`Stream::value`] dispatches on the mode
//! so that a message body needs only one serialization routine for both
//! directions.
//!
//! All multi-byte values are little-endian on the wire.

/// Error when a [`Stream`] operation cannot complete.
///
/// Operations are atomic: on error, the stream cursor has not moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The buffer has fewer than `need` bytes left at the cursor.
    #[error("buffer too short: need {need} bytes at {at}, buffer is {len}")]
    TooShort {
        /// How many bytes the operation needed.
        need: usize,
        /// Cursor position when the operation was attempted.
        at: usize,
        /// Total buffer length.
        len: usize,
    },
    /// The quantization step is too fine for the target integer width.
    #[error("quantization step too small for target width")]
    StepTooSmall,
}

/// Whether a [`Stream`] reads values out of its buffer or writes them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// The stream reads values out of the buffer.
    Read,
    /// The stream writes values into the buffer.
    Write,
}

/// Cursor over a caller-provided fixed-length byte buffer.
///
/// See the [module-level documentation](self).
#[derive(Debug)]
pub struct Stream<'a> {
    buf: &'a mut [u8],
    index: usize,
    mode: StreamMode,
}

macro_rules! impl_primitive {
    ($ty:ty, $read:ident, $write:ident, $value:ident) => {
        /// Reads one value at the cursor and advances past it.
        pub fn $read(&mut self) -> Result<$ty, StreamError> {
            const WIDTH: usize = std::mem::size_of::<$ty>();
            let at = self.check(WIDTH)?;
            let mut bytes = [0; WIDTH];
            bytes.copy_from_slice(&self.buf[at..at + WIDTH]);
            self.index = at + WIDTH;
            Ok(<$ty>::from_le_bytes(bytes))
        }

        /// Writes one value at the cursor and advances past it.
        pub fn $write(&mut self, value: $ty) -> Result<(), StreamError> {
            const WIDTH: usize = std::mem::size_of::<$ty>();
            let at = self.check(WIDTH)?;
            self.buf[at..at + WIDTH].copy_from_slice(&value.to_le_bytes());
            self.index = at + WIDTH;
            Ok(())
        }

        /// Reads into or writes out of `value` according to the stream mode.
        pub fn $value(&mut self, value: &mut $ty) -> Result<(), StreamError> {
            match self.mode {
                StreamMode::Read => {
                    *value = self.$read()?;
                    Ok(())
                }
                StreamMode::Write => self.$write(*value),
            }
        }
    };
}

impl<'a> Stream<'a> {
    /// Creates a stream which reads values out of `buf`.
    pub fn reader(buf: &'a mut [u8]) -> Self {
        Self::new(buf, StreamMode::Read)
    }

    /// Creates a stream which writes values into `buf`.
    pub fn writer(buf: &'a mut [u8]) -> Self {
        Self::new(buf, StreamMode::Write)
    }

    /// Creates a stream over `buf` in the given mode.
    pub fn new(buf: &'a mut [u8], mode: StreamMode) -> Self {
        Self {
            buf,
            index: 0,
            mode,
        }
    }

    /// Mode this stream was constructed in.
    #[must_use]
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Current cursor position in bytes.
    #[must_use]
    pub fn position(&self) -> usize {
        self.index
    }

    /// How many bytes are left between the cursor and the buffer end.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.index
    }

    /// Whether the cursor has reached the end of the buffer.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.index >= self.buf.len()
    }

    /// Whether `n` more bytes fit between the cursor and the buffer end.
    #[must_use]
    pub fn fits(&self, n: usize) -> bool {
        self.index + n <= self.buf.len()
    }

    /// Moves the cursor forward by `n` bytes, saturating at the buffer end.
    pub fn skip(&mut self, n: usize) {
        self.index = usize::min(self.index + n, self.buf.len());
    }

    /// Moves the cursor backward by `n` bytes, saturating at the start.
    pub fn rewind(&mut self, n: usize) {
        self.index = self.index.saturating_sub(n);
    }

    fn check(&self, width: usize) -> Result<usize, StreamError> {
        if self.fits(width) {
            Ok(self.index)
        } else {
            Err(StreamError::TooShort {
                need: width,
                at: self.index,
                len: self.buf.len(),
            })
        }
    }

    impl_primitive!(u8, read_u8, write_u8, value_u8);
    impl_primitive!(i16, read_i16, write_i16, value_i16);
    impl_primitive!(u16, read_u16, write_u16, value_u16);
    impl_primitive!(i32, read_i32, write_i32, value_i32);
    impl_primitive!(u32, read_u32, write_u32, value_u32);
    impl_primitive!(i64, read_i64, write_i64, value_i64);
    impl_primitive!(u64, read_u64, write_u64, value_u64);

    /// Reads one IEEE-754 `f32` at the cursor and advances past it.
    pub fn read_f32(&mut self) -> Result<f32, StreamError> {
        self.read_u32().map(f32::from_bits)
    }

    /// Writes one IEEE-754 `f32` at the cursor and advances past it.
    pub fn write_f32(&mut self, value: f32) -> Result<(), StreamError> {
        self.write_u32(value.to_bits())
    }

    /// Reads into or writes out of `value` according to the stream mode.
    pub fn value_f32(&mut self, value: &mut f32) -> Result<(), StreamError> {
        match self.mode {
            StreamMode::Read => {
                *value = self.read_f32()?;
                Ok(())
            }
            StreamMode::Write => self.write_f32(*value),
        }
    }

    /// Reads one [`QFloat`]-quantized `f32` stored as a `u16`.
    pub fn read_qfloat(&mut self, min: f32, max: f32) -> Result<f32, StreamError> {
        self.read_u16()
            .map(|q| QFloat::from_u16(q, min, max).value())
    }

    /// Writes `value` quantized into a `u16` over the range `[min, max]`.
    pub fn write_qfloat(
        &mut self,
        value: f32,
        min: f32,
        max: f32,
        step: f32,
    ) -> Result<(), StreamError> {
        let q = QFloat::new(value, min, max, step).to_u16()?;
        self.write_u16(q)
    }

    /// Reads into or writes out of `value` as a `u16`-quantized float,
    /// according to the stream mode.
    pub fn value_qfloat(
        &mut self,
        value: &mut f32,
        min: f32,
        max: f32,
        step: f32,
    ) -> Result<(), StreamError> {
        match self.mode {
            StreamMode::Read => {
                *value = self.read_qfloat(min, max)?;
                Ok(())
            }
            StreamMode::Write => self.write_qfloat(*value, min, max, step),
        }
    }
}

/// Quantized float: an `f32` in a known `[min, max]` range mapped onto the
/// full range of a small unsigned integer.
///
/// `step` is the coarsest reconstruction error the caller will accept; the
/// conversion fails with [`StreamError::StepTooSmall`] if the target integer
/// cannot distinguish that many intervals. Quantized values are clamped to
/// `MAX - 1` of the target width.
#[derive(Debug, Clone, Copy)]
pub struct QFloat {
    value: f32,
    min: f32,
    max: f32,
    step: f32,
}

impl QFloat {
    /// Wraps a raw float for quantization.
    #[must_use]
    pub fn new(value: f32, min: f32, max: f32, step: f32) -> Self {
        Self {
            value,
            min,
            max,
            step,
        }
    }

    /// Reconstructs a float from its `u8`-quantized form.
    #[must_use]
    pub fn from_u8(q: u8, min: f32, max: f32) -> Self {
        let norm = f32::from(q) / f32::from(u8::MAX);
        Self::new(denormalize(norm, min, max), min, max, 0.0)
    }

    /// Reconstructs a float from its `u16`-quantized form.
    #[must_use]
    pub fn from_u16(q: u16, min: f32, max: f32) -> Self {
        let norm = f32::from(q) / f32::from(u16::MAX);
        Self::new(denormalize(norm, min, max), min, max, 0.0)
    }

    /// Reconstructs a float from its `u32`-quantized form.
    #[must_use]
    pub fn from_u32(q: u32, min: f32, max: f32) -> Self {
        let norm = (f64::from(q) / f64::from(u32::MAX)) as f32;
        Self::new(denormalize(norm, min, max), min, max, 0.0)
    }

    /// The wrapped (or reconstructed) float value.
    #[must_use]
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Quantizes into a `u8`.
    pub fn to_u8(&self) -> Result<u8, StreamError> {
        let q = self.quantize(f32::from(u8::MAX))? as u32;
        Ok(u32::min(q, u32::from(u8::MAX) - 1) as u8)
    }

    /// Quantizes into a `u16`.
    pub fn to_u16(&self) -> Result<u16, StreamError> {
        let q = self.quantize(f32::from(u16::MAX))? as u32;
        Ok(u32::min(q, u32::from(u16::MAX) - 1) as u16)
    }

    /// Quantizes into a `u32`.
    pub fn to_u32(&self) -> Result<u32, StreamError> {
        let q = self.quantize(u32::MAX as f32)? as u64;
        Ok(u64::min(q, u64::from(u32::MAX) - 1) as u32)
    }

    fn quantize(&self, target_max: f32) -> Result<f32, StreamError> {
        // how many distinct values the caller needs
        let intervals = (self.max - self.min) / self.step;
        if intervals >= target_max {
            return Err(StreamError::StepTooSmall);
        }
        let norm = normalize(self.value, self.min, self.max);
        Ok(norm * target_max)
    }
}

fn normalize(value: f32, min: f32, max: f32) -> f32 {
    (value - min) / (max - min)
}

fn denormalize(norm: f32, min: f32, max: f32) -> f32 {
    min + norm * (max - min)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn round_trip_primitives() {
        let mut buf = [0; 64];
        let mut s = Stream::writer(&mut buf);
        s.write_u8(0xAB).unwrap();
        s.write_i16(-1234).unwrap();
        s.write_u16(0xBEEF).unwrap();
        s.write_i32(-123_456).unwrap();
        s.write_u32(0xDEAD_CAFE).unwrap();
        s.write_i64(-1_234_567_890_123).unwrap();
        s.write_u64(0xFEED_FACE_CAFE_BEEF).unwrap();
        s.write_f32(1.5).unwrap();
        let len = s.position();

        let mut s = Stream::reader(&mut buf);
        assert_eq!(0xAB, s.read_u8().unwrap());
        assert_eq!(-1234, s.read_i16().unwrap());
        assert_eq!(0xBEEF, s.read_u16().unwrap());
        assert_eq!(-123_456, s.read_i32().unwrap());
        assert_eq!(0xDEAD_CAFE, s.read_u32().unwrap());
        assert_eq!(-1_234_567_890_123, s.read_i64().unwrap());
        assert_eq!(0xFEED_FACE_CAFE_BEEF, s.read_u64().unwrap());
        assert_eq!(1.5, s.read_f32().unwrap());
        assert_eq!(len, s.position());
    }

    #[test]
    fn little_endian_on_the_wire() {
        let mut buf = [0; 4];
        let mut s = Stream::writer(&mut buf);
        s.write_u32(0x1234_5678).unwrap();
        assert_eq!([0x78, 0x56, 0x34, 0x12], buf);
    }

    #[test]
    fn failure_does_not_advance() {
        let mut buf = [0; 3];
        let mut s = Stream::writer(&mut buf);
        s.write_u16(7).unwrap();
        assert_matches!(
            s.write_u32(1),
            Err(StreamError::TooShort { need: 4, at: 2, len: 3 })
        );
        assert_eq!(2, s.position());
        // a smaller value still fits after the failure
        s.write_u8(9).unwrap();
        assert!(s.is_full());
    }

    #[test]
    fn skip_and_rewind_saturate() {
        let mut buf = [0; 8];
        let mut s = Stream::reader(&mut buf);
        s.skip(100);
        assert_eq!(8, s.position());
        s.rewind(3);
        assert_eq!(5, s.position());
        s.rewind(100);
        assert_eq!(0, s.position());
    }

    #[test]
    fn mode_dispatch() {
        let mut buf = [0; 8];
        let mut value: u32 = 0xCAFE;
        let mut s = Stream::writer(&mut buf);
        s.value_u32(&mut value).unwrap();

        let mut read_back: u32 = 0;
        let mut s = Stream::reader(&mut buf);
        s.value_u32(&mut read_back).unwrap();
        assert_eq!(value, read_back);
    }

    #[test]
    fn qfloat_round_trip() {
        let (min, max, step) = (-10.0, 10.0, 0.01);
        let mut buf = [0; 2];
        for v in [-9.99, -5.0, 0.0, 0.125, 3.75, 9.99] {
            let mut s = Stream::writer(&mut buf);
            s.write_qfloat(v, min, max, step).unwrap();
            let mut s = Stream::reader(&mut buf);
            let got = s.read_qfloat(min, max).unwrap();
            assert!((got - v).abs() <= step, "{v} came back as {got}");
        }
    }

    #[test]
    fn qfloat_step_too_small() {
        let qf = QFloat::new(0.0, 0.0, 1000.0, 0.0001);
        assert_matches!(qf.to_u16(), Err(StreamError::StepTooSmall));
        // u32 has room for ten million intervals
        assert_matches!(qf.to_u32(), Ok(_));
    }

    #[test]
    fn qfloat_clamps_to_max_minus_one() {
        let qf = QFloat::new(1.0, 0.0, 1.0, 0.01);
        assert_eq!(u16::MAX - 1, qf.to_u16().unwrap());
    }
}
