use crate::{CodecError, FrameDecoder};
use std::sync::Arc;
use strand_buf::Cumulation;
use strand_channel::{Ctx, Msg};
use strand_core::Cause;

/// Splits a byte stream on line endings (`\n` or `\r\n`).
///
/// Frames longer than `max_length` raise [`CodecError::FrameTooLong`]: with
/// `fail_fast` the error fires the moment the accumulated length exceeds the
/// limit, otherwise only once the delimiter finally arrives (with the full
/// discarded length). A cached scan offset remembers how far previous calls
/// searched, so a frame split across many deliveries is scanned once, not
/// quadratically.
pub struct LineDecoder {
    max_length: usize,
    strip_delimiter: bool,
    fail_fast: bool,
    /// True while an over-long frame's bytes are being thrown away.
    discarding: bool,
    discarded: usize,
    /// Scan offset relative to the read cursor; survives partial deliveries
    /// within a single pending frame and resets on every successful find.
    offset: usize,
}

impl LineDecoder {
    /// Framer with `strip_delimiter = false` and `fail_fast = true`.
    pub fn new(max_length: usize) -> Self {
        assert!(max_length > 0, "max_length must be positive");
        Self {
            max_length,
            strip_delimiter: false,
            fail_fast: true,
            discarding: false,
            discarded: 0,
            offset: 0,
        }
    }

    /// Emitted frames exclude the line ending.
    pub fn with_strip_delimiter(mut self, strip: bool) -> Self {
        self.strip_delimiter = strip;
        self
    }

    /// Raise the over-long error as soon as the limit is crossed instead of
    /// waiting for the delimiter.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Position of the next `\n`, starting the scan where the previous call
    /// stopped. The offset is rebased to the unscanned tail when nothing is
    /// found and reset to 0 on a hit.
    fn find_line_feed(&mut self, input: &Cumulation) -> Option<usize> {
        let from = input.reader_index() + self.offset;
        match input.find_first(from, b'\n') {
            Some(index) => {
                self.offset = 0;
                Some(index)
            }
            None => {
                self.offset = input.readable_bytes();
                None
            }
        }
    }

    fn too_long(&self, length: usize) -> Cause {
        Arc::new(CodecError::FrameTooLong {
            length,
            max: self.max_length,
        })
    }
}

impl FrameDecoder for LineDecoder {
    fn decode(
        &mut self,
        ctx: &Ctx,
        input: &mut Cumulation,
        out: &mut Vec<Msg>,
    ) -> Result<(), Cause> {
        let Some(alloc) = ctx.allocator() else {
            return Ok(());
        };
        let to_cause = |e: strand_buf::BufError| Arc::new(CodecError::from_buf(e)) as Cause;

        let line_feed = self.find_line_feed(input);
        if !self.discarding {
            match line_feed {
                Some(lf) => {
                    let reader = input.reader_index();
                    // CRLF counts as a two-byte delimiter.
                    let (frame_end, delim_len) =
                        if lf > reader && input.get_byte(lf - 1).map_err(to_cause)? == b'\r' {
                            (lf - 1, 2)
                        } else {
                            (lf, 1)
                        };
                    let length = frame_end - reader;
                    if length > self.max_length {
                        input.set_reader_index(lf + 1).map_err(to_cause)?;
                        return Err(self.too_long(length));
                    }
                    let frame = if self.strip_delimiter {
                        let frame = input.read_frame(length, alloc.as_ref()).map_err(to_cause)?;
                        input.skip_bytes(delim_len).map_err(to_cause)?;
                        frame
                    } else {
                        input
                            .read_frame(length + delim_len, alloc.as_ref())
                            .map_err(to_cause)?
                    };
                    out.push(Box::new(frame));
                    Ok(())
                }
                None => {
                    let length = input.readable_bytes();
                    if length > self.max_length {
                        // Start throwing the frame away; the tally feeds the
                        // eventual error length.
                        self.discarded = length;
                        input
                            .set_reader_index(input.writer_index())
                            .map_err(to_cause)?;
                        self.discarding = true;
                        self.offset = 0;
                        if self.fail_fast {
                            return Err(self.too_long(length));
                        }
                    }
                    Ok(())
                }
            }
        } else {
            match line_feed {
                Some(lf) => {
                    let length = self.discarded + (lf - input.reader_index());
                    input.set_reader_index(lf + 1).map_err(to_cause)?;
                    self.offset = 0;
                    self.discarding = false;
                    self.discarded = 0;
                    if !self.fail_fast {
                        return Err(self.too_long(length));
                    }
                    Ok(())
                }
                None => {
                    self.discarded += input.readable_bytes();
                    input
                        .set_reader_index(input.writer_index())
                        .map_err(to_cause)?;
                    self.offset = 0;
                    Ok(())
                }
            }
        }
    }
}
