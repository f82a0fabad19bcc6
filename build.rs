// SPDX-License-Identifier: MIT

use std::io::Write;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // One test per tests/data/*.hid.bin, each must compile without usage
    // roles and produce at least one report.
    let datadir: PathBuf = [env!("CARGO_MANIFEST_DIR"), "tests", "data"].iter().collect();
    let out_dir = std::env::var_os("OUT_DIR").ok_or("OUT_DIR is not set")?;
    let dest_path = PathBuf::from(&out_dir).join("test-report-descriptors.rs");
    let mut file = std::fs::File::create(dest_path)?;

    println!("cargo:rerun-if-changed=tests/data");
    writeln!(file, "use hidschema::*;")?;

    let mut paths = std::fs::read_dir(&datadir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.to_string_lossy().ends_with(".hid.bin"))
        .collect::<Vec<_>>();
    paths.sort();

    for path in paths {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or("Invalid file name")?
            .to_owned();
        let funcname = filename.replace([':', '.', '-'], "_");
        writeln!(
            file,
            "
#[test]
#[allow(non_snake_case)]
fn compile_{funcname}() {{
    let bytes: Vec<u8> = std::fs::read({path:?}).unwrap();
    let rdesc = ReportDescriptor::try_from(&bytes)
        .unwrap_or_else(|e| panic!(\"Failed to compile {filename}: {{e}}\"));
    let reports = Direction::ALL.iter().map(|d| rdesc.reports(*d).len()).sum::<usize>();
    assert!(reports > 0, \"{filename} has no reports\");
}}
"
        )?;
    }

    Ok(())
}
