//! Opens and classifies input files, expands archives, and dispatches parse jobs. Parsing runs
//! in parallel on the worker pool; `read_input_files` joins on all parse jobs before returning,
//! so the pipeline only ever sees fully parsed inputs.
//!
//! Reading supports two phases. In preloading mode, parses run speculatively and the results
//! are cached keyed by `(path, size, mtime)`; the final read then reuses any cache entry whose
//! file hasn't changed, skipping the reparse.

use crate::archive::ArchiveEntry;
use crate::archive::ArchiveIterator;
use crate::args::Args;
use crate::args::InputSpec;
use crate::args::Modifiers;
use crate::error::Context as _;
use crate::error::LinkError;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::linker_script;
use crate::parsing::ObjectFile;
use crate::parsing::ParseResources;
use crate::parsing::SharedFile;
use anyhow::anyhow;
use colosseum::sync::Arena;
use memmap2::Mmap;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

/// Identifies a file on disk at a point in time. A preloaded parse is only reused if the size
/// and modification time still match.
#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    size: u64,
    mtime: (u64, u32),
}

enum ParseRequest<'data> {
    Object {
        data: &'data [u8],
        name: String,
        is_in_lib: bool,
        key: CacheKey,
    },
    CachedObject(Box<ObjectFile<'data>>),
    Shared {
        data: &'data [u8],
        path: PathBuf,
        as_needed: bool,
        key: CacheKey,
    },
    CachedShared(Box<SharedFile<'data>>),
}

enum ParsedFile<'data> {
    Object(CacheKey, Box<ObjectFile<'data>>),
    Shared(CacheKey, Box<SharedFile<'data>>),
}

pub(crate) struct FileReader<'a, 'data> {
    args: &'a Args,
    res: &'a ParseResources<'a, 'data>,
    mmap_arena: &'data Arena<Mmap>,
    preloading: bool,
    obj_cache: HashMap<CacheKey, Vec<Box<ObjectFile<'data>>>>,
    dso_cache: HashMap<CacheKey, Box<SharedFile<'data>>>,
    requests: Vec<ParseRequest<'data>>,

    /// An ENTRY() command seen in a linker script; used if `-e` wasn't given.
    pub(crate) entry_from_script: Option<String>,
}

impl<'a, 'data> FileReader<'a, 'data> {
    pub(crate) fn new(
        args: &'a Args,
        res: &'a ParseResources<'a, 'data>,
        mmap_arena: &'data Arena<Mmap>,
    ) -> Self {
        Self {
            args,
            res,
            mmap_arena,
            preloading: false,
            obj_cache: HashMap::new(),
            dso_cache: HashMap::new(),
            requests: Vec::new(),
            entry_from_script: None,
        }
    }

    /// Speculatively reads and parses all inputs, priming the parse caches for the final read.
    #[tracing::instrument(skip_all, name = "Preload input files")]
    pub(crate) fn preload(&mut self) -> Result {
        self.preloading = true;
        for input in &self.args.inputs {
            self.read_input(input.spec.clone(), input.modifiers)?;
        }
        let parsed = self.run_parse_jobs()?;
        for file in parsed {
            match file {
                ParsedFile::Object(key, obj) => self.obj_cache.entry(key).or_default().push(obj),
                ParsedFile::Shared(key, dso) => {
                    self.dso_cache.insert(key, dso);
                }
            }
        }
        self.preloading = false;
        Ok(())
    }

    /// Reads all command-line inputs (recursing through archives and linker scripts), then joins
    /// on the parse jobs. Results preserve command-line order.
    #[tracing::instrument(skip_all, name = "Read input files")]
    pub(crate) fn read_input_files(
        &mut self,
    ) -> Result<(Vec<ObjectFile<'data>>, Vec<SharedFile<'data>>)> {
        for input in &self.args.inputs {
            self.read_input(input.spec.clone(), input.modifiers)?;
        }
        let parsed = self.run_parse_jobs()?;
        let mut objs = Vec::new();
        let mut dsos = Vec::new();
        for file in parsed {
            match file {
                ParsedFile::Object(_, obj) => objs.push(*obj),
                ParsedFile::Shared(_, dso) => dsos.push(*dso),
            }
        }
        Ok((objs, dsos))
    }

    /// The ingestion barrier: all outstanding parse jobs run to completion here.
    fn run_parse_jobs(&mut self) -> Result<Vec<ParsedFile<'data>>> {
        let requests = std::mem::take(&mut self.requests);
        let res = self.res;
        requests
            .into_par_iter()
            .map(|request| -> Result<ParsedFile<'data>> {
                match request {
                    ParseRequest::Object {
                        data,
                        name,
                        is_in_lib,
                        key,
                    } => Ok(ParsedFile::Object(
                        key,
                        Box::new(ObjectFile::parse(data, name, is_in_lib, res)?),
                    )),
                    ParseRequest::CachedObject(obj) => {
                        Ok(ParsedFile::Object(null_key(), obj))
                    }
                    ParseRequest::Shared {
                        data,
                        path,
                        as_needed,
                        key,
                    } => Ok(ParsedFile::Shared(
                        key,
                        Box::new(SharedFile::parse(data, path, as_needed, res)?),
                    )),
                    ParseRequest::CachedShared(dso) => Ok(ParsedFile::Shared(null_key(), dso)),
                }
            })
            .collect()
    }

    fn read_input(&mut self, spec: InputSpec, modifiers: Modifiers) -> Result {
        match spec {
            InputSpec::File(path) => {
                let (data, _) = self.must_open(&path)?;
                self.read_file(data, &path, modifiers)
                    .with_context(|| format!("Failed to process {}", path.display()))
            }
            InputSpec::Lib(name) => {
                let path = self.find_library(&name)?;
                let (data, _) = self.must_open(&path)?;
                self.read_file(data, &path, modifiers)
                    .with_context(|| format!("Failed to process {}", path.display()))
            }
        }
    }

    /// Dispatches a blob of input bytes based on what kind of file it is.
    fn read_file(&mut self, data: &'data [u8], path: &Path, modifiers: Modifiers) -> Result {
        let kind = FileKind::identify_bytes(data)
            .map_err(|_| anyhow!(LinkError::UnknownFileType(path.to_owned())))?;
        match kind {
            FileKind::ElfObject => {
                let key = cache_key(path, data.len() as u64)?;
                if let Some(obj) = self.take_cached_obj(&key) {
                    self.requests.push(ParseRequest::CachedObject(obj));
                } else {
                    self.requests.push(ParseRequest::Object {
                        data,
                        name: path.display().to_string(),
                        is_in_lib: false,
                        key,
                    });
                }
                Ok(())
            }
            FileKind::ElfDynamic => {
                let key = cache_key(path, data.len() as u64)?;
                if let Some(dso) = self.dso_cache.remove(&key) {
                    self.requests.push(ParseRequest::CachedShared(dso));
                } else {
                    self.requests.push(ParseRequest::Shared {
                        data,
                        path: path.to_owned(),
                        as_needed: modifiers.as_needed,
                        key,
                    });
                }
                Ok(())
            }
            FileKind::Archive => self.read_archive(data, path, modifiers),
            FileKind::ThinArchive => self.read_thin_archive(data, path, modifiers),
            FileKind::Text => self.read_linker_script(data, path, modifiers),
        }
    }

    fn read_archive(&mut self, data: &'data [u8], path: &Path, modifiers: Modifiers) -> Result {
        let key = cache_key(path, data.len() as u64)?;
        if let Some(members) = self.obj_cache.remove(&key) {
            for obj in members {
                self.requests.push(ParseRequest::CachedObject(obj));
            }
            return Ok(());
        }
        let is_in_lib = !modifiers.whole_archive;
        let mut extended_filenames = None;
        for entry in ArchiveIterator::from_archive_bytes(data)
            .map_err(|e| bad_archive(path, &e))?
        {
            let entry = entry.map_err(|e| bad_archive(path, &e))?;
            match entry {
                ArchiveEntry::Ignored => {}
                ArchiveEntry::Filenames(table) => extended_filenames = Some(table),
                ArchiveEntry::Thin(_) => {
                    return Err(bad_archive(
                        path,
                        &anyhow!("thin entry in regular archive"),
                    ));
                }
                ArchiveEntry::Regular(content) => {
                    if content.entry_data.is_empty() {
                        continue;
                    }
                    let member = content.identifier(extended_filenames);
                    let name = format!(
                        "{}({})",
                        path.display(),
                        String::from_utf8_lossy(member.as_slice())
                    );
                    self.requests.push(ParseRequest::Object {
                        data: content.entry_data,
                        name,
                        is_in_lib,
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn read_thin_archive(
        &mut self,
        data: &'data [u8],
        path: &Path,
        modifiers: Modifiers,
    ) -> Result {
        let is_in_lib = !modifiers.whole_archive;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut extended_filenames = None;
        for entry in ArchiveIterator::from_archive_bytes(data)
            .map_err(|e| bad_archive(path, &e))?
        {
            let entry = entry.map_err(|e| bad_archive(path, &e))?;
            match entry {
                ArchiveEntry::Ignored | ArchiveEntry::Regular(_) => {}
                ArchiveEntry::Filenames(table) => extended_filenames = Some(table),
                ArchiveEntry::Thin(thin) => {
                    let member = thin.identifier(extended_filenames).as_path();
                    let member_path = if member.is_absolute() {
                        member.to_owned()
                    } else {
                        parent.join(member)
                    };
                    let (member_data, key) = self.must_open(&member_path)?;
                    if let Some(obj) = self.take_cached_obj(&key) {
                        self.requests.push(ParseRequest::CachedObject(obj));
                    } else {
                        let name =
                            format!("{}({})", path.display(), member_path.display());
                        self.requests.push(ParseRequest::Object {
                            data: member_data,
                            name,
                            is_in_lib,
                            key,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Linker scripts name further inputs, which are read recursively with the script's
    /// directory as an additional search location.
    fn read_linker_script(
        &mut self,
        data: &'data [u8],
        path: &Path,
        modifiers: Modifiers,
    ) -> Result {
        let text = std::str::from_utf8(data)
            .map_err(|_| anyhow!(LinkError::UnknownFileType(path.to_owned())))?;
        let commands = linker_script::parse_script(text)
            .with_context(|| format!("Failed to parse linker script {}", path.display()))?;
        if self.entry_from_script.is_none() {
            self.entry_from_script = commands.entry;
        }
        let script_dir = path.parent().map(Path::to_owned);
        for input in commands.inputs {
            let mut modifiers = modifiers;
            if let Some(as_needed) = input.as_needed {
                modifiers.as_needed = as_needed;
            }
            if let Some(lib) = input.name.strip_prefix("-l") {
                self.read_input(InputSpec::Lib(lib.to_owned()), modifiers)?;
            } else {
                let resolved = self.resolve_script_path(&input.name, script_dir.as_deref())?;
                let (data, _) = self.must_open(&resolved)?;
                self.read_file(data, &resolved, modifiers)
                    .with_context(|| format!("Failed to process {}", resolved.display()))?;
            }
        }
        Ok(())
    }

    fn resolve_script_path(&self, name: &str, script_dir: Option<&Path>) -> Result<PathBuf> {
        let direct = PathBuf::from(name);
        if direct.exists() {
            return Ok(direct);
        }
        if let Some(dir) = script_dir {
            let in_script_dir = dir.join(name);
            if in_script_dir.exists() {
                return Ok(in_script_dir);
            }
        }
        for dir in &self.args.lib_search_path {
            let candidate = self.apply_sysroot(dir).join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(anyhow!(LinkError::LibraryNotFound(name.to_owned())))
    }

    /// Searches the library path for `-lname`, preferring `libname.so` unless `-static`.
    pub(crate) fn find_library(&self, name: &str) -> Result<PathBuf> {
        for dir in &self.args.lib_search_path {
            let dir = self.apply_sysroot(dir);
            if !self.args.is_static {
                let so = dir.join(format!("lib{name}.so"));
                if so.exists() {
                    return Ok(so);
                }
            }
            let ar = dir.join(format!("lib{name}.a"));
            if ar.exists() {
                return Ok(ar);
            }
        }
        Err(anyhow!(LinkError::LibraryNotFound(name.to_owned())))
    }

    /// Absolute search directories are re-rooted under the sysroot when one is set.
    fn apply_sysroot(&self, dir: &Path) -> PathBuf {
        match (&self.args.sysroot, dir.is_absolute()) {
            (Some(sysroot), true) => {
                sysroot.join(dir.strip_prefix("/").unwrap_or(dir))
            }
            _ => dir.to_owned(),
        }
    }

    fn take_cached_obj(&mut self, key: &CacheKey) -> Option<Box<ObjectFile<'data>>> {
        let members = self.obj_cache.get_mut(key)?;
        let obj = members.pop();
        if members.is_empty() {
            self.obj_cache.remove(key);
        }
        obj
    }

    fn must_open(&self, path: &Path) -> Result<(&'data [u8], CacheKey)> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let metadata = file
            .metadata()
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        if metadata.len() == 0 {
            return Err(anyhow!(LinkError::UnknownFileType(path.to_owned())));
        }
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to map {}", path.display()))?;
        let data: &'data [u8] = &*self.mmap_arena.alloc(mmap);
        Ok((data, cache_key(path, metadata.len())?))
    }
}

fn cache_key(path: &Path, size: u64) -> Result<CacheKey> {
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or((0, 0), |d| (d.as_secs(), d.subsec_nanos()));
    Ok(CacheKey {
        path: path.to_owned(),
        size,
        mtime,
    })
}

fn null_key() -> CacheKey {
    CacheKey {
        path: PathBuf::new(),
        size: 0,
        mtime: (0, 0),
    }
}

fn bad_archive(path: &Path, error: &crate::error::Error) -> crate::error::Error {
    anyhow!(LinkError::BadArchive {
        path: path.to_owned(),
        reason: format!("{error:#}"),
    })
}
