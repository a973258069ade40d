use bytes::{BufMut, Bytes, BytesMut};

/// A scatter-gather list: an ordered sequence of memory fragments that together form one logical
///  buffer, plus their precomputed total length.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SgList {
    entries: Vec<Bytes>,
    total_data_size: usize,
}

impl SgList {
    pub fn new() -> SgList {
        SgList::default()
    }

    pub fn from_entries(entries: Vec<Bytes>) -> SgList {
        let total_data_size = entries.iter().map(|e| e.len()).sum();
        SgList {
            entries,
            total_data_size,
        }
    }

    pub fn push(&mut self, entry: Bytes) {
        self.total_data_size += entry.len();
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[Bytes] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Bytes> {
        self.entries
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn total_data_size(&self) -> usize {
        self.total_data_size
    }

    pub fn is_empty(&self) -> bool {
        self.total_data_size == 0
    }

    /// Returns the list's data as a single contiguous buffer. A list with a single entry is
    ///  returned without copying.
    pub fn linearize(&self) -> Bytes {
        match self.entries.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            entries => {
                let mut buf = BytesMut::with_capacity(self.total_data_size);
                for entry in entries {
                    buf.put_slice(entry);
                }
                buf.freeze()
            }
        }
    }
}

impl From<Bytes> for SgList {
    fn from(value: Bytes) -> Self {
        SgList::from_entries(vec![value])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_entry_is_not_copied() {
        let data = Bytes::from_static(&[1, 2, 3, 4]);
        let sgl = SgList::from(data.clone());

        let linear = sgl.linearize();
        assert_eq!(linear, data);
        assert_eq!(linear.as_ptr(), data.as_ptr());
    }

    #[test]
    fn test_gather() {
        let mut sgl = SgList::new();
        sgl.push(Bytes::from_static(&[1, 2]));
        sgl.push(Bytes::from_static(&[]));
        sgl.push(Bytes::from_static(&[3, 4, 5]));

        assert_eq!(sgl.num_entries(), 3);
        assert_eq!(sgl.total_data_size(), 5);
        assert_eq!(sgl.linearize().as_ref(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_empty() {
        let sgl = SgList::new();
        assert!(sgl.is_empty());
        assert!(sgl.linearize().is_empty());
    }
}
