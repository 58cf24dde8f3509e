//! Minimal DER / ASN.1 support for sizing files read from the card.

/// Stateful, simple DER / ASN.1 header reader.
pub struct Reader<'a> {
    buffer: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    /// Creates a new reader from the buffer.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, cursor: 0 }
    }

    /// Reads a next octet and seeks the cursor.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<u8> {
        let byte = *self.buffer.get(self.cursor)?;
        self.cursor += 1;
        Some(byte)
    }

    /// Reads the tag and the length of data at the current position, seeking the cursor to the
    /// start of the contents.
    pub fn read_length(&mut self) -> Option<usize> {
        if self.next()? & 0x1f == 0x1f {
            self.next()?;
        }

        let head = self.next()? as usize;
        if head & 0x80 == 0 {
            return Some(head);
        }

        let mut size = 0usize;
        for _ in 0..(head & 0x7f) {
            size = size.checked_mul(0x100)?;
            size |= self.next()? as usize;
        }

        Some(size)
    }
}

/// Calculates entire size of the payload from the partial buffer of them,
/// `None` when the header itself is truncated.
pub fn entire_size_from_partial(header: &[u8]) -> Option<usize> {
    let mut reader = Reader::new(header);
    let length = reader.read_length()?;

    length.checked_add(reader.cursor)
}
