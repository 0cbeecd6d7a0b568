//src/oracle.rs

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use tempfile::TempDir;

use crate::error::{MetabarError, Result};

/// One sequence handed to an external aligner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRecord {
    pub id: u32,
    pub sequence: String,
    pub abundance: u64,
}

/// De novo chimera verdicts for one group of sequences. The three sets are
/// disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChimeraClassification {
    pub chimera: AHashSet<u32>,
    pub borderline: AHashSet<u32>,
    pub non_chimera: AHashSet<u32>,
}

/// A query aligned against one candidate parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentHit {
    pub query_id: u32,
    pub target_id: u32,
    pub mismatches: u32,
    pub gaps: u32,
    pub identity: f64,
}

impl ParentHit {
    pub fn edits(&self) -> u32 {
        self.mismatches + self.gaps
    }
}

/// Tests each record against more abundant records as potential parents.
pub trait ChimeraOracle: Send + Sync {
    fn classify(&self, records: &[OracleRecord]) -> Result<ChimeraClassification>;
}

/// Global pairwise alignment of queries against a database of sequences.
pub trait AlignmentOracle: Send + Sync {
    fn align(&self, queries: &[OracleRecord], db: &[OracleRecord]) -> Result<Vec<ParentHit>>;
}

/// How to launch vsearch and when to give up on it.
#[derive(Debug, Clone)]
pub struct VsearchOptions {
    pub binary: PathBuf,
    pub threads: usize,
    pub timeout: Duration,
    /// Parent of the per-call scratch directories.
    pub work_dir: PathBuf,
    /// Raised by the embedding application to stop the running call and
    /// refuse new ones. The bundled CLI never raises it.
    pub cancel: Arc<AtomicBool>,
}

impl Default for VsearchOptions {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("vsearch"),
            threads: 1,
            timeout: Duration::from_secs(3600),
            work_dir: std::env::temp_dir(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A per-call scratch directory under `parent`, removed when dropped.
fn scratch_dir(parent: &Path, tag: &str) -> Result<TempDir> {
    fs::create_dir_all(parent)?;
    Ok(tempfile::Builder::new()
        .prefix(&format!("metabar_{tag}_"))
        .tempdir_in(parent)?)
}

/// Writes records as FASTA with usearch-style `;size=` abundance annotations.
pub fn write_fasta<W: Write>(writer: W, records: &[OracleRecord]) -> Result<()> {
    let mut w = BufWriter::new(writer);
    for r in records {
        writeln!(w, ">{};size={}", r.id, r.abundance)?;
        writeln!(w, "{}", r.sequence)?;
    }
    w.flush()?;
    Ok(())
}

/// Ids named by the headers of a FASTA file written by vsearch.
pub fn parse_fasta_ids<R: BufRead>(reader: R, source_name: &str) -> Result<AHashSet<u32>> {
    let mut ids = AHashSet::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some(header) = line.strip_prefix('>') {
            let id_str = header.split(|c: char| c == ';' || c.is_whitespace()).next().unwrap_or_default();
            let id = id_str.parse().map_err(|_| {
                MetabarError::malformed(source_name, i + 1, format!("bad sequence id '{id_str}'"))
            })?;
            ids.insert(id);
        }
    }
    Ok(ids)
}

/// Parses `query target mism gaps id` userout lines. Sequence ids keep any
/// `;size=` suffix vsearch copied from the input headers.
pub fn parse_userout<R: BufRead>(reader: R, source_name: &str) -> Result<Vec<ParentHit>> {
    let mut hits = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 5 {
            return Err(MetabarError::malformed(source_name, i + 1, "expected 5 columns"));
        }
        let bad = |what: &str| MetabarError::malformed(source_name, i + 1, format!("bad {what}"));
        let id = |s: &str| s.split(';').next().unwrap_or_default().parse::<u32>();
        hits.push(ParentHit {
            query_id: id(fields[0]).map_err(|_| bad("query id"))?,
            target_id: id(fields[1]).map_err(|_| bad("target id"))?,
            mismatches: fields[2].trim().parse().map_err(|_| bad("mismatch count"))?,
            gaps: fields[3].trim().parse().map_err(|_| bad("gap count"))?,
            identity: fields[4].trim().parse().map_err(|_| bad("identity"))?,
        });
    }
    Ok(hits)
}

/// Runs `cmd` until it exits, the timeout elapses or `cancel` is raised.
/// A child that does not finish in time is killed. Its stderr goes to
/// `stderr.log` in `scratch` and is quoted in the error on a non-zero exit.
fn run_bounded(mut cmd: Command, tool: &str, opts: &VsearchOptions, scratch: &Path) -> Result<()> {
    if opts.cancel.load(Ordering::Relaxed) {
        return Err(MetabarError::Cancelled);
    }
    let stderr_path = scratch.join("stderr.log");
    log::debug!("running {:?}", cmd);
    let mut child = cmd
        .stdout(Stdio::null())
        .stderr(File::create(&stderr_path)?)
        .spawn()
        .map_err(|e| MetabarError::aligner(tool, format!("failed to start: {e}")))?;

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if opts.cancel.load(Ordering::Relaxed) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(MetabarError::Cancelled);
        }
        if started.elapsed() >= opts.timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(MetabarError::AlignerTimeout {
                tool: tool.to_string(),
                seconds: opts.timeout.as_secs(),
            });
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    if status.success() {
        return Ok(());
    }
    let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();
    Err(MetabarError::aligner(
        tool,
        format!("exit code {:?}: {}", status.code(), stderr.trim()),
    ))
}

fn open_output(path: &Path) -> Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

/// `vsearch --uchime_denovo` behind [`ChimeraOracle`].
#[derive(Debug, Clone, Default)]
pub struct VsearchChimeraOracle {
    pub options: VsearchOptions,
}

impl VsearchChimeraOracle {
    pub fn new(options: VsearchOptions) -> Self {
        Self { options }
    }
}

impl ChimeraOracle for VsearchChimeraOracle {
    fn classify(&self, records: &[OracleRecord]) -> Result<ChimeraClassification> {
        if records.is_empty() {
            return Ok(ChimeraClassification::default());
        }
        let scratch = scratch_dir(&self.options.work_dir, "uchime")?;
        let input = scratch.path().join("input.fa");
        let chimeras = scratch.path().join("chimeras.fa");
        let borderline = scratch.path().join("borderline.fa");
        let nonchimeras = scratch.path().join("nonchimeras.fa");
        write_fasta(File::create(&input)?, records)?;

        let mut cmd = Command::new(&self.options.binary);
        cmd.arg("--uchime_denovo")
            .arg(&input)
            .arg("--chimeras")
            .arg(&chimeras)
            .arg("--borderline")
            .arg(&borderline)
            .arg("--nonchimeras")
            .arg(&nonchimeras)
            .arg("--threads")
            .arg(self.options.threads.to_string())
            .arg("--quiet");
        run_bounded(cmd, "vsearch --uchime_denovo", &self.options, scratch.path())?;

        let read_ids = |path: &Path| -> Result<AHashSet<u32>> {
            if path.exists() {
                parse_fasta_ids(open_output(path)?, &path.display().to_string())
            } else {
                Ok(AHashSet::new())
            }
        };
        Ok(ChimeraClassification {
            chimera: read_ids(&chimeras)?,
            borderline: read_ids(&borderline)?,
            non_chimera: read_ids(&nonchimeras)?,
        })
    }
}

/// `vsearch --usearch_global` behind [`AlignmentOracle`]. Every hit at or
/// above `min_identity` is reported.
#[derive(Debug, Clone)]
pub struct VsearchAlignmentOracle {
    pub options: VsearchOptions,
    pub min_identity: f64,
}

impl VsearchAlignmentOracle {
    pub fn new(options: VsearchOptions, min_identity: f64) -> Self {
        Self { options, min_identity }
    }
}

impl Default for VsearchAlignmentOracle {
    fn default() -> Self {
        Self::new(VsearchOptions::default(), 0.8)
    }
}

impl AlignmentOracle for VsearchAlignmentOracle {
    fn align(&self, queries: &[OracleRecord], db: &[OracleRecord]) -> Result<Vec<ParentHit>> {
        if queries.is_empty() || db.is_empty() {
            return Ok(Vec::new());
        }
        let scratch = scratch_dir(&self.options.work_dir, "usearch_global")?;
        let query_path = scratch.path().join("queries.fa");
        let db_path = scratch.path().join("db.fa");
        let userout = scratch.path().join("userout.tsv");
        write_fasta(File::create(&query_path)?, queries)?;
        write_fasta(File::create(&db_path)?, db)?;

        let mut cmd = Command::new(&self.options.binary);
        cmd.arg("--usearch_global")
            .arg(&query_path)
            .arg("--db")
            .arg(&db_path)
            .arg("--id")
            .arg(self.min_identity.to_string())
            .arg("--maxaccepts")
            .arg("0")
            .arg("--maxrejects")
            .arg("0")
            .arg("--userfields")
            .arg("query+target+mism+gaps+id")
            .arg("--userout")
            .arg(&userout)
            .arg("--threads")
            .arg(self.options.threads.to_string())
            .arg("--quiet");
        run_bounded(cmd, "vsearch --usearch_global", &self.options, scratch.path())?;

        if !userout.exists() {
            return Ok(Vec::new());
        }
        parse_userout(open_output(&userout)?, &userout.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: u32, sequence: &str, abundance: u64) -> OracleRecord {
        OracleRecord { id, sequence: sequence.to_string(), abundance }
    }

    #[test]
    fn test_write_fasta_with_sizes() {
        let mut buf = Vec::new();
        write_fasta(&mut buf, &[rec(7, "ACGT", 120), rec(3, "TTGA", 4)]).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), ">7;size=120\nACGT\n>3;size=4\nTTGA\n");
    }

    #[test]
    fn test_parse_fasta_ids() {
        let fasta = ">7;size=120;\nACGT\n>3;size=4;\nTT\nGA\n";
        let ids = parse_fasta_ids(fasta.as_bytes(), "chimeras.fa").unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&7) && ids.contains(&3));
        assert!(parse_fasta_ids(">abc\nAC\n".as_bytes(), "x").is_err());
    }

    #[test]
    fn test_parse_userout() {
        let tsv = "2;size=10\t1;size=500\t1\t0\t99.6\n3\t1\t0\t2\t99.2\n";
        let hits = parse_userout(tsv.as_bytes(), "userout").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!((hits[0].query_id, hits[0].target_id, hits[0].edits()), (2, 1, 1));
        assert_eq!(hits[1].edits(), 2);
        assert!(parse_userout("1\t2\t0\n".as_bytes(), "userout").is_err());
    }

    #[test]
    fn test_cancelled_before_launch() {
        let options = VsearchOptions {
            cancel: Arc::new(AtomicBool::new(true)),
            ..VsearchOptions::default()
        };
        let oracle = VsearchChimeraOracle::new(options);
        let err = oracle.classify(&[rec(1, "ACGT", 2)]).unwrap_err();
        assert!(matches!(err, MetabarError::Cancelled));
    }

    #[test]
    fn test_missing_binary_is_aligner_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = VsearchOptions {
            binary: PathBuf::from("/nonexistent/vsearch-binary"),
            work_dir: dir.path().to_path_buf(),
            ..VsearchOptions::default()
        };
        let oracle = VsearchAlignmentOracle::new(options, 0.9);
        let err = oracle.align(&[rec(1, "ACGT", 2)], &[rec(2, "ACGA", 5)]).unwrap_err();
        assert!(matches!(err, MetabarError::Aligner { .. }));
    }

    /// Writes an executable shell script standing in for vsearch.
    #[cfg(unix)]
    fn fake_vsearch(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("vsearch");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn options_for(binary: PathBuf, work_dir: &Path, timeout: Duration) -> VsearchOptions {
        VsearchOptions {
            binary,
            timeout,
            work_dir: work_dir.to_path_buf(),
            ..VsearchOptions::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_aligner_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_vsearch(dir.path(), "sleep 30");
        let oracle = VsearchChimeraOracle::new(options_for(binary, dir.path(), Duration::from_millis(300)));
        let started = Instant::now();
        let err = oracle.classify(&[rec(1, "ACGT", 2)]).unwrap_err();
        assert!(matches!(err, MetabarError::AlignerTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_vsearch(dir.path(), "echo 'Fatal error: bad input' >&2\nexit 2");
        let oracle = VsearchAlignmentOracle::new(options_for(binary, dir.path(), Duration::from_secs(30)), 0.9);
        match oracle.align(&[rec(1, "ACGT", 2)], &[rec(2, "ACGA", 5)]).unwrap_err() {
            MetabarError::Aligner { message, .. } => {
                assert!(message.contains("Some(2)"));
                assert!(message.contains("Fatal error: bad input"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_verbose_stderr_does_not_stall() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_vsearch(dir.path(), "i=0\nwhile [ $i -lt 4000 ]; do\n  echo 'progress line padded to about fifty bytes......' >&2\n  i=$((i+1))\ndone\nexit 0");
        let oracle = VsearchChimeraOracle::new(options_for(binary, dir.path(), Duration::from_secs(20)));
        let classes = oracle.classify(&[rec(1, "ACGT", 2)]).unwrap();
        assert_eq!(classes, ChimeraClassification::default());
    }

    #[test]
    fn test_scratch_dirs_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let options = VsearchOptions {
            binary: PathBuf::from("/nonexistent/vsearch-binary"),
            work_dir: dir.path().join("work"),
            ..VsearchOptions::default()
        };
        let oracle = VsearchChimeraOracle::new(options);
        assert!(oracle.classify(&[rec(1, "ACGT", 2)]).is_err());
        assert_eq!(fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }
}
