use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

use crate::device::{ComputeDevice, KernelId, ProgramId, ProgramInput};
use crate::ui;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    AlwaysCompile,
    CompileThenCache,
    AlwaysUseBinary,
}

#[derive(Clone, Debug)]
pub struct ProgramSpec<'a> {
    pub cache_name: &'a str,
    pub sources: &'a [&'a str],
    pub entry_points: &'a [&'a str],
    pub options: String,
    pub policy: CachePolicy,
}

/// Ready-to-launch kernels keyed by entry-point name.
#[derive(Clone, Debug, Default)]
pub struct KernelSet {
    kernels: BTreeMap<String, KernelId>,
}

impl KernelSet {
    pub fn get(&self, entry_point: &str) -> Result<KernelId> {
        self.kernels
            .get(entry_point)
            .copied()
            .ok_or_else(|| anyhow!("kernel {entry_point} was not compiled"))
    }

    pub fn extend(&mut self, other: KernelSet) {
        self.kernels.extend(other.kernels);
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

pub struct KernelCompiler {
    source_dir: PathBuf,
    cache_dir: PathBuf,
}

impl KernelCompiler {
    pub fn new(source_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn build_options(&self, extra: &str) -> String {
        let base = format!("-Werror -I {}", self.source_dir.display());
        if extra.is_empty() {
            base
        } else {
            format!("{base} {extra}")
        }
    }

    pub fn cache_path(&self, cache_name: &str) -> PathBuf {
        self.cache_dir.join(cache_name)
    }

    /// Builds `spec` on `device` and creates one kernel per entry point.
    pub fn compile<D: ComputeDevice>(&self, device: &mut D, spec: &ProgramSpec<'_>) -> Result<KernelSet> {
        let options = self.build_options(&spec.options);
        let program = match self.program_from_binary(device, spec, &options)? {
            Some(program) => program,
            None => self.program_from_source(device, spec, &options)?,
        };

        let mut set = KernelSet::default();
        for entry_point in spec.entry_points {
            let kernel = device
                .create_kernel(program, entry_point)
                .with_context(|| format!("failed to create kernel {entry_point} from {}", spec.cache_name));
            let kernel = match kernel {
                Ok(kernel) => kernel,
                Err(err) => {
                    device.release_program(program);
                    return Err(err);
                }
            };
            set.kernels.insert((*entry_point).to_string(), kernel);
        }
        device.release_program(program);
        Ok(set)
    }

    fn program_from_binary<D: ComputeDevice>(
        &self,
        device: &mut D,
        spec: &ProgramSpec<'_>,
        options: &str,
    ) -> Result<Option<ProgramId>> {
        if spec.policy == CachePolicy::AlwaysCompile {
            return Ok(None);
        }
        let path = self.cache_path(spec.cache_name);
        let binary = match read_optional(&path)? {
            Some(binary) => binary,
            None => match device.builtin_binary(spec.cache_name) {
                Some(binary) => binary,
                None if spec.policy == CachePolicy::AlwaysUseBinary => {
                    bail!("couldn't open prebuilt kernel binary {}", path.display());
                }
                None => return Ok(None),
            },
        };

        match device.build_program(spec.cache_name, ProgramInput::Binary(&binary), options) {
            Ok(program) => {
                ui::info("BUILD", format!("loaded {}", spec.cache_name));
                Ok(Some(program))
            }
            Err(err) if spec.policy == CachePolicy::CompileThenCache => {
                ui::warn(
                    "BUILD",
                    format!("cached {} is unusable ({err}), recompiling", spec.cache_name),
                );
                Ok(None)
            }
            Err(err) => Err(err).with_context(|| format!("failed to load {}", path.display())),
        }
    }

    fn program_from_source<D: ComputeDevice>(
        &self,
        device: &mut D,
        spec: &ProgramSpec<'_>,
        options: &str,
    ) -> Result<ProgramId> {
        let mut sources = Vec::with_capacity(spec.sources.len());
        for source_id in spec.sources {
            let path = self.source_dir.join(source_id);
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound => device
                    .builtin_source(source_id)
                    .ok_or_else(|| anyhow!("couldn't open kernel source {}", path.display()))?,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to read {}", path.display()));
                }
            };
            sources.push(text);
        }

        ui::info("BUILD", format!("compiling {} [{options}]", spec.cache_name));
        let program = device
            .build_program(spec.cache_name, ProgramInput::Source(&sources), options)
            .with_context(|| format!("failed to compile {}", spec.cache_name))?;

        if spec.policy == CachePolicy::CompileThenCache {
            if let Err(err) = self.save_binary(device, program, spec.cache_name) {
                ui::warn("BUILD", format!("{err:#}"));
            }
        }
        Ok(program)
    }

    fn save_binary<D: ComputeDevice>(&self, device: &D, program: ProgramId, cache_name: &str) -> Result<()> {
        let binary = device
            .program_binary(program)
            .with_context(|| format!("failed to fetch binary for {cache_name}"))?;
        fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("failed to create {}", self.cache_dir.display()))?;
        let path = self.cache_path(cache_name);
        fs::write(&path, binary).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}
