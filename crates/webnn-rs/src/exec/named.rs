//! Name-keyed buffer views passed to and from `Graph::compute`.

/// Caller bytes for one graph input. The tensor starts at `byte_offset` and runs to the end of
/// `bytes`.
///
/// `bytes[byte_offset..]` must be exactly the descriptor's byte size; `compute` rejects anything
/// shorter or longer.
#[derive(Debug, Clone, Copy)]
pub struct Input<'a> {
    pub bytes: &'a [u8],
    pub byte_offset: usize,
}

impl<'a> Input<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            byte_offset: 0,
        }
    }

    pub fn with_offset(bytes: &'a [u8], byte_offset: usize) -> Self {
        Self { bytes, byte_offset }
    }

    /// The tensor bytes, or `None` when the offset is past the end.
    pub fn data(&self) -> Option<&'a [u8]> {
        self.bytes.get(self.byte_offset..)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NamedInputs<'a> {
    records: Vec<(String, Input<'a>)>,
}

impl<'a> NamedInputs<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name`, replacing an earlier binding of the same name.
    pub fn set(&mut self, name: impl Into<String>, input: Input<'a>) -> &mut Self {
        let name = name.into();
        match self.records.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = input,
            None => self.records.push((name, input)),
        }
        self
    }

    pub fn set_bytes(&mut self, name: impl Into<String>, bytes: &'a [u8]) -> &mut Self {
        self.set(name, Input::new(bytes))
    }

    pub fn get(&self, name: &str) -> Option<&Input<'a>> {
        self.records
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, input)| input)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
pub enum OutputBuffer<'a> {
    /// Caller-provided storage, written in place.
    Borrowed(&'a mut [u8]),
    /// Storage allocated by the engine for an output the caller did not provide.
    Owned(Vec<u8>),
}

impl OutputBuffer<'_> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            OutputBuffer::Borrowed(bytes) => bytes,
            OutputBuffer::Owned(bytes) => bytes,
        }
    }
}

/// Output destinations. Outputs that are not set are allocated during compute and can be read
/// back by name afterwards.
#[derive(Debug, Default)]
pub struct NamedOutputs<'a> {
    records: Vec<(String, OutputBuffer<'a>)>,
}

impl<'a> NamedOutputs<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, buffer: &'a mut [u8]) -> &mut Self {
        self.insert(name.into(), OutputBuffer::Borrowed(buffer));
        self
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.records
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, buffer)| buffer.as_slice())
    }

    /// Decodes a float32 output.
    pub fn get_f32(&self, name: &str) -> Option<Vec<f32>> {
        self.get(name).map(|bytes| {
            bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect()
        })
    }

    /// Takes an engine-allocated output; caller-provided buffers are not returned.
    pub fn take(&mut self, name: &str) -> Option<Vec<u8>> {
        let index = self.records.iter().position(|(existing, buffer)| {
            existing == name && matches!(buffer, OutputBuffer::Owned(_))
        })?;
        match self.records.remove(index).1 {
            OutputBuffer::Owned(bytes) => Some(bytes),
            OutputBuffer::Borrowed(_) => None,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|(name, _)| name.as_str())
    }

    pub(crate) fn is_owned(&self, name: &str) -> bool {
        self.records
            .iter()
            .any(|(existing, buffer)| existing == name && matches!(buffer, OutputBuffer::Owned(_)))
    }

    pub(crate) fn buffer_mut(&mut self, name: &str) -> Option<&mut OutputBuffer<'a>> {
        self.records
            .iter_mut()
            .find(|(existing, _)| existing == name)
            .map(|(_, buffer)| buffer)
    }

    pub(crate) fn insert_owned(&mut self, name: &str, bytes: Vec<u8>) {
        self.insert(name.to_string(), OutputBuffer::Owned(bytes));
    }

    fn insert(&mut self, name: String, buffer: OutputBuffer<'a>) {
        match self.records.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = buffer,
            None => self.records.push((name, buffer)),
        }
    }
}
