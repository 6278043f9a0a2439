//! Best-effort coverage exchange with a central server.
//!
//! The engine only ever talks through [`CoverageClient`]; failures are
//! logged and swallowed, local fuzzing never depends on the server.
//! Frames are little-endian and length-prefixed, one connection per
//! call.

use crate::crash::CrashRegistry;
use crate::util::stop_soon;
use anyhow::Context;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use quarry_core::coverage::Coverage;
use quarry_core::sample::Sample;
use quarry_core::MAX_SAMPLE_SIZE;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

const OP_REPORT_COVERAGE: u8 = 1;
const OP_REPORT_CRASH: u8 = 2;
const OP_GET_UPDATES: u8 = 3;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Client side of the exchange, serialized by the engine's server lock.
pub trait CoverageClient {
    /// Publish newly found edges; `sample` is the canonical reproducer,
    /// or `None` for variable-only coverage.
    fn report_new_coverage(
        &mut self,
        coverage: &Coverage,
        sample: Option<&Sample>,
    ) -> anyhow::Result<()>;

    fn report_crash(&mut self, sample: &Sample, crash_name: &str) -> anyhow::Result<()>;

    /// Pull samples other instances contributed since the last call and
    /// append them to `out`.
    fn get_updates(&mut self, out: &mut VecDeque<Sample>, total_execs: u64) -> anyhow::Result<()>;
}

pub struct TcpCoverageClient {
    addr: String,
    cursor: u64,
}

impl TcpCoverageClient {
    pub fn new(addr: String) -> Self {
        Self { addr, cursor: 0 }
    }

    fn connect(&self) -> anyhow::Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr)
            .with_context(|| format!("failed to connect to {}", self.addr))?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        Ok(stream)
    }
}

impl CoverageClient for TcpCoverageClient {
    fn report_new_coverage(
        &mut self,
        coverage: &Coverage,
        sample: Option<&Sample>,
    ) -> anyhow::Result<()> {
        let mut stream = self.connect()?;
        stream.write_u8(OP_REPORT_COVERAGE)?;
        coverage.write_to(&mut stream)?;
        match sample {
            Some(sample) => {
                stream.write_u8(1)?;
                write_sample(&mut stream, sample)?;
            }
            None => stream.write_u8(0)?,
        }
        stream.flush()?;
        stream.read_u8().context("no ack from server")?;
        Ok(())
    }

    fn report_crash(&mut self, sample: &Sample, crash_name: &str) -> anyhow::Result<()> {
        let mut stream = self.connect()?;
        stream.write_u8(OP_REPORT_CRASH)?;
        stream.write_u32::<LittleEndian>(crash_name.len() as u32)?;
        stream.write_all(crash_name.as_bytes())?;
        write_sample(&mut stream, sample)?;
        stream.flush()?;
        stream.read_u8().context("no ack from server")?;
        Ok(())
    }

    fn get_updates(&mut self, out: &mut VecDeque<Sample>, total_execs: u64) -> anyhow::Result<()> {
        let mut stream = self.connect()?;
        stream.write_u8(OP_GET_UPDATES)?;
        stream.write_u64::<LittleEndian>(self.cursor)?;
        stream.write_u64::<LittleEndian>(total_execs)?;
        stream.flush()?;

        self.cursor = stream.read_u64::<LittleEndian>()?;
        let count = stream.read_u32::<LittleEndian>()?;
        for _ in 0..count {
            out.push_back(read_sample(&mut stream)?);
        }
        Ok(())
    }
}

fn write_sample<W: Write>(w: &mut W, sample: &Sample) -> anyhow::Result<()> {
    w.write_u32::<LittleEndian>(sample.len() as u32)?;
    w.write_all(sample.as_bytes())?;
    Ok(())
}

fn read_sample<R: Read>(r: &mut R) -> anyhow::Result<Sample> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    if len > MAX_SAMPLE_SIZE {
        anyhow::bail!("sample of {} bytes exceeds the size cap", len);
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    Ok(Sample::new(bytes))
}

/// The central exchange started with `--start-server`. Keeps the union
/// of everything reported and the samples that contributed new edges;
/// nothing is persisted except crashes.
pub struct CoverageServer {
    coverage: Coverage,
    samples: Vec<Sample>,
    crashes: CrashRegistry,
    crash_dir: PathBuf,
}

impl CoverageServer {
    pub fn new(out_dir: PathBuf) -> Self {
        Self {
            coverage: Coverage::new(),
            samples: Vec::new(),
            crashes: CrashRegistry::new(),
            crash_dir: out_dir.join("crashes"),
        }
    }

    pub fn run(&mut self, addr: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.crash_dir)
            .with_context(|| format!("failed to create {}", self.crash_dir.display()))?;
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind {}", addr))?;
        log::info!("coverage server listening on {}", addr);

        for stream in listener.incoming() {
            if stop_soon() {
                break;
            }
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("failed to accept connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.handle_client(stream) {
                log::warn!("client error: {}", e);
            }
        }
        Ok(())
    }

    fn handle_client(&mut self, mut stream: TcpStream) -> anyhow::Result<()> {
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        match stream.read_u8()? {
            OP_REPORT_COVERAGE => {
                let incoming = Coverage::read_from(&mut stream)?;
                let has_sample = stream.read_u8()? == 1;
                let sample = if has_sample {
                    Some(read_sample(&mut stream)?)
                } else {
                    None
                };
                self.accept_coverage(incoming, sample);
                stream.write_u8(1)?;
            }
            OP_REPORT_CRASH => {
                let name_len = stream.read_u32::<LittleEndian>()? as usize;
                if name_len > 1024 {
                    anyhow::bail!("oversized crash name");
                }
                let mut name = vec![0u8; name_len];
                stream.read_exact(&mut name)?;
                let name = String::from_utf8_lossy(&name).into_owned();
                let sample = read_sample(&mut stream)?;
                self.accept_crash(&name, &sample);
                stream.write_u8(1)?;
            }
            OP_GET_UPDATES => {
                let cursor = stream.read_u64::<LittleEndian>()? as usize;
                let total_execs = stream.read_u64::<LittleEndian>()?;
                log::debug!("update request, client execs: {}", total_execs);
                let fresh = self.samples.get(cursor..).unwrap_or(&[]);
                stream.write_u64::<LittleEndian>(self.samples.len() as u64)?;
                stream.write_u32::<LittleEndian>(fresh.len() as u32)?;
                for sample in fresh {
                    write_sample(&mut stream, sample)?;
                }
            }
            op => anyhow::bail!("unknown request op {}", op),
        }
        stream.flush()?;
        Ok(())
    }

    fn accept_coverage(&mut self, incoming: Coverage, sample: Option<Sample>) {
        let novel = incoming.difference(&self.coverage);
        if novel.is_empty() {
            return;
        }
        self.coverage.merge(&novel);
        log::info!(
            "{} new edges reported, total: {}",
            novel.num_edges(),
            self.coverage.num_edges()
        );
        if let Some(sample) = sample {
            self.samples.push(sample);
        }
    }

    fn accept_crash(&mut self, name: &str, sample: &Sample) {
        let (should_save, duplicates) = self.crashes.record(name);
        if !should_save {
            return;
        }
        log::info!("crash reported: {}", name);
        let path = self.crash_dir.join(format!("{}_{}", name, duplicates));
        if let Err(e) = sample.save(&path) {
            log::warn!("failed to save crash {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage(edges: &[(&str, u64)]) -> Coverage {
        let mut cov = Coverage::new();
        for (module, offset) in edges {
            cov.add_edge(module, *offset);
        }
        cov
    }

    #[test]
    fn server_keeps_samples_that_added_edges() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = CoverageServer::new(dir.path().to_path_buf());

        server.accept_coverage(coverage(&[("a", 1)]), Some(Sample::new(vec![1])));
        // already known, sample not kept
        server.accept_coverage(coverage(&[("a", 1)]), Some(Sample::new(vec![2])));
        // variable-only report, no reproducer attached
        server.accept_coverage(coverage(&[("a", 2)]), None);

        assert_eq!(server.samples.len(), 1);
        assert_eq!(server.coverage.num_edges(), 2);
    }

    #[test]
    fn server_saves_crashes_up_to_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = CoverageServer::new(dir.path().to_path_buf());
        std::fs::create_dir_all(dir.path().join("crashes")).unwrap();

        for _ in 0..crate::crash::MAX_IDENTICAL_CRASHES + 2 {
            server.accept_crash("sigsegv_0x0", &Sample::new(vec![0]));
        }
        let files = std::fs::read_dir(dir.path().join("crashes")).unwrap().count();
        assert_eq!(files as u64, crate::crash::MAX_IDENTICAL_CRASHES);
    }
}
