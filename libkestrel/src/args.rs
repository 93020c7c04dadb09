//! A handwritten parser for our arguments.
//!
//! We don't use a third-party argument library because we need to parse arguments the way other
//! linkers on the platform do: long options are accepted with either one or two leading dashes,
//! `--as-needed` and friends are positional state that attaches to the inputs that follow them,
//! and `@file` expands a response file in place.

use crate::error::Context as _;
use crate::error::LinkError;
use crate::error::Result;
use anyhow::bail;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug)]
pub struct Args {
    pub(crate) output: PathBuf,
    pub(crate) inputs: Vec<Input>,
    pub(crate) lib_search_path: Vec<PathBuf>,
    pub(crate) sysroot: Option<PathBuf>,

    pub(crate) output_kind: OutputKind,
    pub(crate) is_static: bool,
    pub(crate) pie: bool,
    pub(crate) image_base: u64,

    pub(crate) entry: Option<String>,
    pub(crate) init: String,
    pub(crate) fini: String,
    pub(crate) soname: Option<String>,
    pub(crate) rpaths: Vec<String>,
    pub(crate) dynamic_linker: Option<String>,

    pub(crate) undefined: Vec<String>,
    pub(crate) export_dynamic: bool,
    pub(crate) b_symbolic: bool,
    pub(crate) b_symbolic_functions: bool,

    pub(crate) gc_sections: bool,
    pub(crate) icf: bool,
    pub(crate) hash_style: HashStyle,
    pub(crate) build_id: BuildIdOption,
    pub(crate) strip_all: bool,
    pub(crate) allow_multiple_definition: bool,
    pub(crate) eh_frame_hdr: bool,

    pub(crate) thread_count: usize,
    pub(crate) preload: bool,

    pub(crate) trace: bool,
    pub(crate) trace_symbol: Vec<String>,
    pub(crate) print_map: bool,
    pub(crate) print_stats: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputKind {
    Executable,
    SharedObject,
}

/// Positional state that attaches to each input as it appears on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Modifiers {
    /// Whether shared objects from this point on are linked only if referenced.
    pub(crate) as_needed: bool,

    /// Whether archive members from this point on are included unconditionally.
    pub(crate) whole_archive: bool,
}

impl Default for Modifiers {
    fn default() -> Self {
        Self {
            as_needed: false,
            whole_archive: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Input {
    pub(crate) spec: InputSpec,
    pub(crate) modifiers: Modifiers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InputSpec {
    /// A path to a file, possibly relative.
    File(PathBuf),

    /// The name of a library given via `-l`, without the `lib` prefix and suffix.
    Lib(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HashStyle {
    Sysv,
    Gnu,
    Both,
}

impl HashStyle {
    pub(crate) fn includes_sysv(self) -> bool {
        matches!(self, HashStyle::Sysv | HashStyle::Both)
    }

    pub(crate) fn includes_gnu(self) -> bool {
        matches!(self, HashStyle::Gnu | HashStyle::Both)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BuildIdOption {
    None,
    Fast,
    Uuid,
    Hex(Vec<u8>),
}

pub(crate) const DEFAULT_IMAGE_BASE: u64 = 0x200000;

impl Default for Args {
    fn default() -> Self {
        Self {
            output: PathBuf::new(),
            inputs: Vec::new(),
            lib_search_path: Vec::new(),
            sysroot: None,
            output_kind: OutputKind::Executable,
            is_static: false,
            pie: false,
            image_base: DEFAULT_IMAGE_BASE,
            entry: None,
            init: "_init".to_owned(),
            fini: "_fini".to_owned(),
            soname: None,
            rpaths: Vec::new(),
            dynamic_linker: None,
            undefined: Vec::new(),
            export_dynamic: false,
            b_symbolic: false,
            b_symbolic_functions: false,
            gc_sections: false,
            icf: false,
            hash_style: HashStyle::Both,
            build_id: BuildIdOption::None,
            strip_all: false,
            allow_multiple_definition: false,
            eh_frame_hdr: false,
            thread_count: 0,
            preload: false,
            trace: false,
            trace_symbol: Vec::new(),
            print_map: false,
            print_stats: false,
        }
    }
}

impl Args {
    /// Whether the image gets a load address of zero and relies on the loader to relocate it.
    pub(crate) fn is_relocatable(&self) -> bool {
        self.pie || self.output_kind == OutputKind::SharedObject
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.output_kind == OutputKind::SharedObject
    }

    pub(crate) fn needs_dynamic_sections(&self) -> bool {
        !self.is_static
    }

    pub(crate) fn setup_thread_pool(&self) -> Result {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if self.thread_count > 0 {
            builder = builder.num_threads(self.thread_count);
        }
        builder
            .build_global()
            .context("Failed to set up thread pool")?;
        Ok(())
    }
}

/// Takes the value for an option that was supplied either as `--opt=value` (already split into
/// `inline`) or as a separate following argument.
fn option_value(
    inline: &mut Option<String>,
    input: &mut std::vec::IntoIter<String>,
    name: &str,
) -> Result<String> {
    match inline.take() {
        Some(v) => Ok(v),
        None => input
            .next()
            .with_context(|| format!("Missing value for {name}")),
    }
}

pub(crate) fn parse<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Args> {
    let mut args = Args::default();
    let mut modifiers = Modifiers::default();
    let mut unrecognised = Vec::new();

    let mut input = expand_response_files(input)?.into_iter();

    while let Some(arg) = input.next() {
        let arg = arg.as_str();

        if let Some(rest) = strip_option(arg) {
            let (name, mut inline_value) = match rest.split_once('=') {
                Some((name, value)) => (name, Some(value.to_owned())),
                None => (rest, None),
            };
            macro_rules! value {
                ($display_name:literal) => {
                    option_value(&mut inline_value, &mut input, $display_name)
                };
            }
            match name {
                "o" | "output" => args.output = PathBuf::from(value!("-o")?),
                "L" | "library-path" => args.lib_search_path.push(PathBuf::from(value!("-L")?)),
                "l" | "library" => args.inputs.push(Input {
                    spec: InputSpec::Lib(value!("-l")?),
                    modifiers,
                }),
                "sysroot" => args.sysroot = Some(PathBuf::from(value!("--sysroot")?)),
                "shared" | "Bshareable" => args.output_kind = OutputKind::SharedObject,
                "static" | "Bstatic" | "dn" | "non_shared" => args.is_static = true,
                "Bdynamic" | "dy" | "call_shared" => args.is_static = false,
                "pie" | "pic-executable" => args.pie = true,
                "no-pie" => args.pie = false,
                "image-base" | "Ttext" => {
                    args.image_base = parse_number(&value!("--image-base")?)
                        .context("Invalid --image-base")?;
                }
                "e" | "entry" => args.entry = Some(value!("--entry")?),
                "init" => args.init = value!("-init")?,
                "fini" => args.fini = value!("-fini")?,
                "soname" | "h" => args.soname = Some(value!("-soname")?),
                "rpath" | "R" => args.rpaths.push(value!("-rpath")?),
                "dynamic-linker" | "I" => args.dynamic_linker = Some(value!("--dynamic-linker")?),
                "no-dynamic-linker" => args.dynamic_linker = None,
                "u" | "undefined" => args.undefined.push(value!("--undefined")?),
                "export-dynamic" | "E" => args.export_dynamic = true,
                "no-export-dynamic" => args.export_dynamic = false,
                "Bsymbolic" => args.b_symbolic = true,
                "Bsymbolic-functions" => args.b_symbolic_functions = true,
                "as-needed" => modifiers.as_needed = true,
                "no-as-needed" => modifiers.as_needed = false,
                "whole-archive" => modifiers.whole_archive = true,
                "no-whole-archive" => modifiers.whole_archive = false,
                "gc-sections" => args.gc_sections = true,
                "no-gc-sections" => args.gc_sections = false,
                "icf" => {
                    // Accepts `--icf=all` / `--icf=none` like other linkers.
                    let v = inline_value.take().unwrap_or_else(|| "all".to_owned());
                    args.icf = v != "none";
                }
                "hash-style" => {
                    args.hash_style = match value!("--hash-style")?.as_str() {
                        "sysv" => HashStyle::Sysv,
                        "gnu" => HashStyle::Gnu,
                        "both" => HashStyle::Both,
                        other => bail!("Invalid --hash-style `{other}`"),
                    };
                }
                "build-id" => {
                    let v = inline_value.take().unwrap_or_else(|| "fast".to_owned());
                    args.build_id = match v.as_str() {
                        "none" => BuildIdOption::None,
                        "fast" | "md5" | "sha1" => BuildIdOption::Fast,
                        "uuid" => BuildIdOption::Uuid,
                        other => {
                            if let Some(hex) = other.strip_prefix("0x") {
                                BuildIdOption::Hex(
                                    parse_hex_bytes(hex).context("Invalid --build-id value")?,
                                )
                            } else {
                                bail!("Invalid --build-id value `{other}`");
                            }
                        }
                    };
                }
                "strip-all" | "s" => args.strip_all = true,
                "strip-debug" | "S" => {}
                "allow-multiple-definition" => args.allow_multiple_definition = true,
                "eh-frame-hdr" => args.eh_frame_hdr = true,
                "no-eh-frame-hdr" => args.eh_frame_hdr = false,
                "thread-count" | "threads" => {
                    args.thread_count = value!("--thread-count")?
                        .parse()
                        .context("Invalid --thread-count")?;
                }
                "no-threads" => args.thread_count = 1,
                "preload" => args.preload = true,
                "trace" | "t" => args.trace = true,
                "trace-symbol" | "y" => args.trace_symbol.push(value!("--trace-symbol")?),
                "print-map" | "M" => args.print_map = true,
                "print-stats" => args.print_stats = true,
                // Flags that we accept but that don't change our behaviour.
                "m" => {
                    value!("-m")?;
                }
                "z" => {
                    value!("-z")?;
                }
                "start-group" | "(" | "end-group" | ")" | "nostdlib" | "color-diagnostics"
                | "no-undefined" | "fatal-warnings" | "no-fatal-warnings" | "g" | "O" | "v"
                | "version" | "relax" | "no-relax" | "discard-locals" | "X" | "EL" => {}
                "plugin" | "plugin-opt" => {
                    value!("-plugin")?;
                }
                other => {
                    // Joined short options like `-lc` or `-L/usr/lib`. These are only tried once
                    // the long names above have failed to match, which is how ld resolves the
                    // ambiguity between e.g. `-entry` and `-e ntry`.
                    let first = other.as_bytes()[0];
                    let mut rest_value = other[1..].to_owned();
                    if let Some(v) = inline_value.take() {
                        rest_value = format!("{rest_value}={v}");
                    }
                    if rest_value.is_empty() {
                        unrecognised.push(format!("-{other}"));
                    } else {
                        match first {
                            b'l' => args.inputs.push(Input {
                                spec: InputSpec::Lib(rest_value),
                                modifiers,
                            }),
                            b'L' => args.lib_search_path.push(PathBuf::from(rest_value)),
                            b'o' => args.output = PathBuf::from(rest_value),
                            b'u' => args.undefined.push(rest_value),
                            b'y' => args.trace_symbol.push(rest_value),
                            b'h' => args.soname = Some(rest_value),
                            b'R' => args.rpaths.push(rest_value),
                            b'I' => args.dynamic_linker = Some(rest_value),
                            b'e' => args.entry = Some(rest_value),
                            b'm' | b'z' => {}
                            _ => unrecognised.push(format!("-{other}")),
                        }
                    }
                }
            }
            if let Some(v) = inline_value {
                bail!("Unexpected value `{v}` for flag -{name}");
            }
        } else {
            args.inputs.push(Input {
                spec: InputSpec::File(PathBuf::from(arg)),
                modifiers,
            });
        }
    }

    if !unrecognised.is_empty() {
        bail!("unrecognized option(s): {}", unrecognised.join(", "));
    }
    if args.output.as_os_str().is_empty() {
        bail!(LinkError::MissingOption("-o"));
    }
    if args.is_relocatable() {
        args.image_base = 0;
    }
    if args.dynamic_linker.is_none()
        && !args.is_static
        && args.output_kind == OutputKind::Executable
    {
        args.dynamic_linker = Some("/lib64/ld-linux-x86-64.so.2".to_owned());
    }

    Ok(args)
}

/// Expands `@file` arguments by splicing in the whitespace-separated contents of the named file.
fn expand_response_files<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for arg in input {
        let arg = arg.as_ref();
        if let Some(path) = arg.strip_prefix('@') {
            let contents = std::fs::read_to_string(Path::new(path))
                .with_context(|| format!("Failed to read response file `{path}`"))?;
            for token in response_file_tokens(&contents) {
                out.push(token);
            }
        } else {
            out.push(arg.to_owned());
        }
    }
    Ok(out)
}

/// Splits a response file into tokens. Quoting with single or double quotes is honoured so that
/// paths containing spaces survive the round trip through a response file.
fn response_file_tokens(contents: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in contents.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if ch.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(ch),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Long options are accepted with either one or two dashes. A lone "-" is not an option.
fn strip_option(arg: &str) -> Option<&str> {
    arg.strip_prefix("--")
        .or_else(|| arg.strip_prefix('-'))
        .filter(|rest| !rest.is_empty())
}

fn parse_number(s: &str) -> Result<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Ok(u64::from_str_radix(hex, 16)?)
    } else {
        Ok(s.parse()?)
    }
}

fn parse_hex_bytes(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        bail!("Odd number of hex digits");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| e.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(args: &[&str]) -> Args {
        parse(args.iter().copied()).unwrap()
    }

    #[test]
    fn test_basic_link_line() {
        let args = parse_ok(&[
            "-o",
            "out",
            "crt1.o",
            "--as-needed",
            "-lc",
            "--no-as-needed",
            "main.o",
        ]);
        assert_eq!(args.output, PathBuf::from("out"));
        assert_eq!(args.inputs.len(), 3);
        assert_eq!(args.inputs[0].spec, InputSpec::File(PathBuf::from("crt1.o")));
        assert!(!args.inputs[0].modifiers.as_needed);
        assert_eq!(args.inputs[1].spec, InputSpec::Lib("c".to_owned()));
        assert!(args.inputs[1].modifiers.as_needed);
        assert!(!args.inputs[2].modifiers.as_needed);
    }

    #[test]
    fn test_equals_and_separate_values() {
        let args = parse_ok(&["-o=a", "--hash-style=gnu", "--image-base", "0x400000", "x.o"]);
        assert_eq!(args.hash_style, HashStyle::Gnu);
        assert_eq!(args.image_base, 0x400000);
    }

    #[test]
    fn test_shared_forces_zero_base() {
        let args = parse_ok(&["-o", "liba.so", "-shared", "-soname", "liba.so.1", "a.o"]);
        assert_eq!(args.output_kind, OutputKind::SharedObject);
        assert_eq!(args.image_base, 0);
        assert_eq!(args.soname.as_deref(), Some("liba.so.1"));
    }

    #[test]
    fn test_missing_output_is_an_error() {
        assert!(parse(["a.o"].iter().copied()).is_err());
    }

    #[test]
    fn test_unrecognised_option() {
        assert!(parse(["-o", "out", "--definitely-not-a-flag"].iter().copied()).is_err());
    }

    #[test]
    fn test_build_id_values() {
        assert_eq!(parse_ok(&["-o", "a", "--build-id"]).build_id, BuildIdOption::Fast);
        assert_eq!(
            parse_ok(&["-o", "a", "--build-id=uuid"]).build_id,
            BuildIdOption::Uuid
        );
        assert_eq!(
            parse_ok(&["-o", "a", "--build-id=0xdeadbeef"]).build_id,
            BuildIdOption::Hex(vec![0xde, 0xad, 0xbe, 0xef])
        );
    }

    #[test]
    fn test_response_file_tokens() {
        assert_eq!(
            response_file_tokens("a \"b c\" \nd"),
            vec!["a".to_owned(), "b c".to_owned(), "d".to_owned()]
        );
    }
}
