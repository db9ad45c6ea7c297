//! Rewrites the version number across every platform build descriptor in
//! the RP42 source tree: the Apple Info.plist files, the Android version
//! code and gradle fields, the top-level VERSION file, and the Windows
//! resource header. Run from the project root.
//!
//! Files are patched in order and a failure leaves the earlier ones
//! patched; rerunning with the same version is idempotent apart from the
//! Android version code bump.

use std::{fs, path::Path};

use anyhow::{Context, Result, bail, ensure};
use clap::Parser;

const PLISTS: &[&str] = &[
    "mac/Info.plist",
    "macdashboard/Info.plist",
    "iphone/Info.plist",
];

#[derive(Parser)]
#[command(version, about = "Propagate a version number into the platform build descriptors")]
struct Opt {
    /// Version in 1.2.3a notation: one to three numeric components and an
    /// optional trailing lowercase letter.
    version: String,

    /// Do not bump the Android version code.
    #[arg(short = 'a')]
    keep_android_code: bool,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    let version = Version::parse(&opt.version)?;

    for plist in PLISTS {
        patch_plist(Path::new(plist), &version)
            .with_context(|| format!("Failed to patch {plist}"))?;
    }

    patch_android(Path::new("android"), &version, !opt.keep_android_code)
        .context("Failed to patch the Android build")?;

    write_version_files(&version)
}

/// A version in `1.2.3a` notation. The optional letter becomes a fourth
/// numeric component (`a` is 1), so `1.2.3a` orders after `1.2.3`.
struct Version {
    /// The input verbatim, used wherever the human-readable form is wanted.
    name: String,
    comps: [u32; 4],
}

impl Version {
    fn parse(raw: &str) -> Result<Self> {
        ensure!(!raw.is_empty(), "empty version");

        let (numeric, letter) = match raw.chars().next_back() {
            Some(c) if c.is_ascii_lowercase() => {
                (&raw[..raw.len() - 1], c as u32 - 'a' as u32 + 1)
            }
            _ => (raw, 0),
        };

        let parts: Vec<&str> = numeric.split('.').collect();
        ensure!(
            (1..=3).contains(&parts.len()),
            "expected one to three numeric components: {raw:?}"
        );

        let mut comps = [0, 0, 0, letter];
        for (i, part) in parts.iter().enumerate() {
            comps[i] = part
                .parse()
                .with_context(|| format!("bad numeric component {part:?} in {raw:?}"))?;
        }

        Ok(Version {
            name: raw.to_string(),
            comps,
        })
    }

    /// Dotted rendering over the first `width` components, trailing zero
    /// components suppressed, always at least the major component.
    fn dotted_width(&self, width: usize) -> String {
        let mut last = 1;
        for (i, c) in self.comps[..width].iter().enumerate() {
            if *c != 0 {
                last = i + 1;
            }
        }
        self.comps[..last]
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }

    /// All four components, for CFBundleVersion.
    fn dotted(&self) -> String {
        self.dotted_width(4)
    }

    /// The three numeric components without the letter, for
    /// CFBundleShortVersionString.
    fn short_dotted(&self) -> String {
        self.dotted_width(3)
    }
}

/// Replaces the `<string>` values following the CFBundleVersion and
/// CFBundleShortVersionString keys. The rewrite goes to a `.new` sibling
/// which only replaces the original once both keys have been found.
fn patch_plist(path: &Path, version: &Version) -> Result<()> {
    let input = fs::read_to_string(path)?;
    let output = patch_plist_text(&input, version)?;

    let tmp = path.with_extension("plist.new");
    fs::write(&tmp, output)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn patch_plist_text(input: &str, version: &Version) -> Result<String> {
    let full = version.dotted();
    let short = version.short_dotted();

    let mut out = String::with_capacity(input.len());
    let mut pending: Option<&str> = None;
    let mut seen = 0u8;

    for line in input.lines() {
        if let Some(value) = pending.take() {
            let start = line.find("<string>").map(|p| p + "<string>".len());
            let end = line.find("</string>");
            let (Some(start), Some(end)) = (start, end) else {
                bail!("version key not followed by a <string> value");
            };
            out.push_str(&line[..start]);
            out.push_str(value);
            out.push_str(&line[end..]);
        } else {
            if line.contains("<key>CFBundleVersion</key>") {
                pending = Some(&full);
                seen |= 1;
            } else if line.contains("<key>CFBundleShortVersionString</key>") {
                pending = Some(&short);
                seen |= 2;
            }
            out.push_str(line);
        }
        out.push('\n');
    }

    ensure!(
        seen == 3,
        "CFBundleVersion or CFBundleShortVersionString not found"
    );
    Ok(out)
}

/// Bumps `android/version.code` (a bare monotonic integer unrelated to the
/// version number) and rewrites the `versionCode` and `versionName` fields
/// of the gradle build.
fn patch_android(dir: &Path, version: &Version, bump_code: bool) -> Result<()> {
    let gradle_path = dir.join("app/build.gradle");
    let mut gradle = fs::read_to_string(&gradle_path)?;

    if bump_code {
        let code_path = dir.join("version.code");
        let code: u32 = fs::read_to_string(&code_path)?
            .trim()
            .parse()
            .context("bad android/version.code")?;
        fs::write(&code_path, (code + 1).to_string())?;
        gradle = set_version_code(&gradle, code + 1)?;
    }

    gradle = set_version_name(&gradle, &version.name)?;
    fs::write(&gradle_path, gradle)?;
    Ok(())
}

/// Rewrites `versionCode <digits>` in place.
fn set_version_code(gradle: &str, code: u32) -> Result<String> {
    const KEY: &str = "versionCode ";

    let start = gradle.find(KEY).context("versionCode not found")? + KEY.len();
    let digits = gradle[start..]
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(gradle.len() - start);
    Ok(format!(
        "{}{}{}",
        &gradle[..start],
        code,
        &gradle[start + digits..]
    ))
}

/// Rewrites the quoted `versionName "…"` value in place.
fn set_version_name(gradle: &str, name: &str) -> Result<String> {
    const KEY: &str = "versionName \"";

    let start = gradle.find(KEY).context("versionName not found")? + KEY.len();
    let quote = gradle[start..]
        .find('"')
        .context("unterminated versionName")?;
    Ok(format!(
        "{}{}{}",
        &gradle[..start],
        name,
        &gradle[start + quote..]
    ))
}

fn write_version_files(version: &Version) -> Result<()> {
    fs::write("VERSION", format!("{}\n", version.name)).context("Failed to write VERSION")?;

    let [c0, c1, c2, c3] = version.comps;
    let rc = format!(
        "#define RP42_VERSION_1 \"RP42 {name}\"\n\
         #define RP42_VERSION_2 \"{name}\\0\"\n\
         #define RP42_VERSION_3 {c0},{c1},{c2},{c3}\n\
         #define RP42_VERSION_4 \"Release {name}\"\n",
        name = version.name,
    );
    fs::write("windows/VERSION.rc", rc).context("Failed to write windows/VERSION.rc")
}
