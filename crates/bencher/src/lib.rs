use bytes::Bytes;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Copy, Clone)]
pub struct TestCase {
    name: &'static str,
    group: TestGroup,
    payload: TestPayload,
}

impl TestCase {
    pub fn new(name: &'static str, group: TestGroup, payload: TestPayload) -> Self {
        Self { name, group, payload }
    }

    pub fn small(name: &'static str, payload: TestPayload) -> Self {
        Self::new(name, TestGroup::Small, payload)
    }

    pub fn normal(name: &'static str, payload: TestPayload) -> Self {
        Self::new(name, TestGroup::Normal, payload)
    }

    pub fn large(name: &'static str, payload: TestPayload) -> Self {
        Self::new(name, TestGroup::Large, payload)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn group(&self) -> TestGroup {
        self.group
    }

    pub fn payload(&self) -> &TestPayload {
        &self.payload
    }
}

/// A body split into `chunks` chunks of `chunk_len` bytes each.
#[derive(Debug, Copy, Clone)]
pub struct TestPayload {
    chunks: usize,
    chunk_len: usize,
}

impl TestPayload {
    pub const fn new(chunks: usize, chunk_len: usize) -> Self {
        Self { chunks, chunk_len }
    }

    pub fn total_len(&self) -> usize {
        self.chunks * self.chunk_len
    }

    pub fn chunks(&self) -> Vec<Bytes> {
        (0..self.chunks).map(|i| Bytes::from(vec![ALPHABET[i % ALPHABET.len()]; self.chunk_len])).collect()
    }
}

#[derive(Clone, Copy, Debug)]
pub enum TestGroup {
    Small,
    Normal,
    Large,
}
