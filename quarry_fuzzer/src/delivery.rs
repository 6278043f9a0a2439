//! Sample delivery transports.

use quarry_core::exec::SampleDelivery;
use quarry_core::sample::Sample;
use quarry_core::MAX_SAMPLE_SIZE;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::fs;
use std::io;
use std::path::PathBuf;

/// Writes the sample to a per-worker file the target reads.
pub struct FileDelivery {
    path: PathBuf,
}

impl FileDelivery {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SampleDelivery for FileDelivery {
    fn deliver(&mut self, sample: &Sample) -> io::Result<()> {
        fs::write(&self.path, sample.as_bytes())
    }
}

/// Writes the sample into a named shared memory region the target maps:
/// a 4-byte little-endian length prefix followed by the payload.
pub struct ShmemDelivery {
    shmem: Shmem,
}

impl ShmemDelivery {
    pub fn new(os_id: &str) -> io::Result<Self> {
        let size = MAX_SAMPLE_SIZE + 4;
        let shmem = match ShmemConf::new().os_id(os_id).size(size).create() {
            Ok(mut shmem) => {
                shmem.set_owner(true);
                shmem
            }
            Err(ShmemError::MappingIdExists) => {
                let mut shmem = ShmemConf::new()
                    .os_id(os_id)
                    .size(size)
                    .open()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                shmem.set_owner(true);
                shmem
            }
            Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
        };
        Ok(Self { shmem })
    }
}

impl SampleDelivery for ShmemDelivery {
    fn deliver(&mut self, sample: &Sample) -> io::Result<()> {
        if sample.len() > MAX_SAMPLE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "sample exceeds the shared memory region",
            ));
        }
        let len = (sample.len() as u32).to_le_bytes();
        unsafe {
            let ptr = self.shmem.as_ptr();
            std::ptr::copy_nonoverlapping(len.as_ptr(), ptr, 4);
            std::ptr::copy_nonoverlapping(sample.as_bytes().as_ptr(), ptr.add(4), sample.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_delivery_writes_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input_1");
        let mut delivery = FileDelivery::new(path.clone());
        delivery.deliver(&Sample::new(b"abc".to_vec())).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abc");

        // redelivery overwrites
        delivery.deliver(&Sample::new(b"xy".to_vec())).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"xy");
    }
}
