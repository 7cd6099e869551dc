use crate::config::READ_BUFFER_SIZE;
use anyhow::{Context, Result};
use bzip2::read::MultiBzDecoder;
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const XML_SUFFIX: &str = ".xml";
const BZ2_SUFFIX: &str = ".xml.bz2";

/// One dump ready to be streamed.
pub struct DumpSource {
    /// File name without the `.xml` / `.xml.bz2` suffix
    pub name: String,
    pub path: PathBuf,
    pub reader: Box<dyn BufRead + Send>,
}

/// Supplies dumps to the importer, one at a time.
pub trait Fetcher {
    /// `None` once every dump has been handed out.
    fn next_dump(&mut self) -> Option<Result<DumpSource>>;

    /// Deletes the local copy of a dump (tight mode).
    fn remove(&mut self, name: &str) -> Result<()>;
}

/// Serves dumps from a local folder. An extracted `<name>.xml` wins over
/// `<name>.xml.bz2`; archives are decompressed while streaming.
pub struct DirFetcher {
    dir: PathBuf,
    pending: VecDeque<PathBuf>,
}

impl DirFetcher {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Cannot read dump folder {}", dir.display()))?;

        let mut dumps: BTreeMap<String, PathBuf> = BTreeMap::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(name) = file_name.strip_suffix(BZ2_SUFFIX) {
                dumps.entry(name.to_string()).or_insert(path.clone());
            } else if let Some(name) = file_name.strip_suffix(XML_SUFFIX) {
                dumps.insert(name.to_string(), path.clone());
            }
        }

        info!(folder = %dir.display(), dumps = dumps.len(), "Found dumps");
        Ok(Self {
            dir,
            pending: dumps.into_values().collect(),
        })
    }

    /// Keeps only the dumps named in `names`, in that order. Unknown names are
    /// logged and ignored; an empty selection keeps everything.
    pub fn with_selection<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        if names.is_empty() {
            return self;
        }

        let mut selected = VecDeque::with_capacity(names.len());
        for name in &names {
            match self.pending.iter().position(|p| dump_name(p) == *name) {
                Some(pos) => selected.extend(self.pending.remove(pos)),
                None => warn!(dump = %name, "Selected dump not found"),
            }
        }
        self.pending = selected;
        self
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Names of the dumps still to be handed out, in order.
    pub fn names(&self) -> Vec<String> {
        self.pending.iter().map(|p| dump_name(p)).collect()
    }
}

fn dump_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    file_name
        .strip_suffix(BZ2_SUFFIX)
        .or_else(|| file_name.strip_suffix(XML_SUFFIX))
        .unwrap_or(&file_name)
        .to_string()
}

fn open_dump_file(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file =
        File::open(path).with_context(|| format!("Cannot open dump {}", path.display()))?;
    let is_archive = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(BZ2_SUFFIX));

    if is_archive {
        // Multistream dumps are a concatenation of bzip2 streams
        let decoder = MultiBzDecoder::new(BufReader::with_capacity(READ_BUFFER_SIZE, file));
        Ok(Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, decoder)))
    } else {
        Ok(Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file)))
    }
}

impl Fetcher for DirFetcher {
    fn next_dump(&mut self) -> Option<Result<DumpSource>> {
        let path = self.pending.pop_front()?;
        let name = dump_name(&path);
        debug!(dump = %name, path = %path.display(), "Opening dump");
        Some(open_dump_file(&path).map(|reader| DumpSource { name, path, reader }))
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        for suffix in [XML_SUFFIX, BZ2_SUFFIX] {
            let path = self.dir.join(format!("{name}{suffix}"));
            match std::fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "Removed dump file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Cannot remove {}", path.display()))
                }
            }
        }
        Ok(())
    }
}
