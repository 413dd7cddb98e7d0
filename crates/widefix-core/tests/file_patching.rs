//! End-to-end patching of executables on disk.

use std::fs;

use tempfile::TempDir;
use widefix_core::fix::{FileOptions, FixState, backup_path, patch_file};
use widefix_core::{ProfileSet, Settings};

const PROFILES: &str = r#"
    [[profile]]
    name = "Offsets"
    executable = "game.exe"

    [[profile.fix]]
    name = "aspect"

    [[profile.fix.site]]
    name = "ratio"
    locate = { file_offset = 0x100 }
    action = { kind = "aspect_ratio" }

    [[profile.fix]]
    name = "fov"

    [[profile.fix.site]]
    name = "hfov"
    locate = { pattern = "C7 05 ?? ?? ?? ?? 00 00 B4 42", offset = 6 }
    action = { kind = "horizontal_fov", original = 90.0 }

    [[profile.fix]]
    name = "menus"

    [[profile.fix.site]]
    name = "width"
    locate = { pattern = "B8 00 04 00 00" , offset = 1 }
    action = { kind = "resolution", axis = "width" }

    [[profile.fix.site]]
    name = "absent"
    locate = { pattern = "FE ED FA CE" }
    action = { kind = "resolution", axis = "height" }
"#;

/// 0x200-byte image: 4:3 constant at 0x100, `mov [x], 90.0f` at 0x40,
/// `mov eax, 1024` at 0x80.
fn image() -> Vec<u8> {
    let mut data = vec![0u8; 0x200];
    data[0x100..0x104].copy_from_slice(&(4.0f32 / 3.0).to_le_bytes());
    data[0x40..0x4A].copy_from_slice(&[0xC7, 0x05, 0x10, 0x20, 0x30, 0x00, 0x00, 0x00, 0xB4, 0x42]);
    data[0x80..0x85].copy_from_slice(&[0xB8, 0x00, 0x04, 0x00, 0x00]);
    data
}

fn f32_at(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn setup() -> (TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("game.exe");
    fs::write(&path, image()).unwrap();
    (dir, path)
}

fn profiles() -> ProfileSet {
    ProfileSet::from_toml_str(PROFILES).unwrap()
}

#[test]
fn writes_aspect_ratio_at_file_offset() {
    let (_dir, path) = setup();
    let set = profiles();
    let profile = set.get("Offsets").unwrap();

    let report = patch_file(
        &path,
        profile,
        Settings::new(1600, 900, 1.0).unwrap(),
        FileOptions::default(),
    )
    .unwrap();

    let data = fs::read(&path).unwrap();
    let ratio = f32_at(&data, 0x100);
    assert!((ratio - 1.777778).abs() < 1e-6, "got {ratio}");
    assert_eq!(ratio.to_bits(), (1600.0f32 / 900.0).to_bits());
    assert_eq!(report.outcome("aspect").unwrap().state, FixState::Applied);
}

#[test]
fn rescales_horizontal_fov_to_widescreen() {
    let (_dir, path) = setup();
    let set = profiles();

    patch_file(
        &path,
        set.get("Offsets").unwrap(),
        Settings::new(1920, 1080, 1.0).unwrap(),
        FileOptions::default(),
    )
    .unwrap();

    let hfov = f32_at(&fs::read(&path).unwrap(), 0x46);
    assert!((hfov - 106.25984).abs() < 1e-3, "got {hfov}");
}

#[test]
fn missing_signature_fails_only_its_fix() {
    let (_dir, path) = setup();
    let set = profiles();

    let report = patch_file(
        &path,
        set.get("Offsets").unwrap(),
        Settings::new(1920, 1080, 1.0).unwrap(),
        FileOptions::default(),
    )
    .unwrap();

    assert_eq!(report.applied(), 2);
    let menus = report.outcome("menus").unwrap();
    assert_eq!(menus.state, FixState::Failed);
    assert!(menus.error.as_deref().unwrap_or_default().contains("absent"));

    // The batch is all-or-nothing: the width that was found stays untouched.
    let data = fs::read(&path).unwrap();
    assert_eq!(&data[0x80..0x85], &[0xB8, 0x00, 0x04, 0x00, 0x00]);
}

#[test]
fn out_of_bounds_offset_writes_nothing() {
    let (_dir, path) = setup();
    let set = ProfileSet::from_toml_str(
        r#"
        [[profile]]
        name = "Broken"
        executable = "game.exe"

        [[profile.fix]]
        name = "past_end"

        [[profile.fix.site]]
        name = "ratio"
        locate = { file_offset = 0x1FE }
        action = { kind = "aspect_ratio" }
        "#,
    )
    .unwrap();

    let report = patch_file(
        &path,
        set.get("Broken").unwrap(),
        Settings::new(1920, 1080, 1.0).unwrap(),
        FileOptions {
            backup: true,
            dry_run: false,
        },
    )
    .unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(fs::read(&path).unwrap(), image());
    assert!(!backup_path(&path).exists());
}

#[test]
fn backup_keeps_the_first_original() {
    let (_dir, path) = setup();
    let set = profiles();
    let profile = set.get("Offsets").unwrap();
    let options = FileOptions {
        backup: true,
        dry_run: false,
    };

    patch_file(&path, profile, Settings::new(1920, 1080, 1.0).unwrap(), options).unwrap();
    patch_file(&path, profile, Settings::new(2560, 1080, 1.0).unwrap(), options).unwrap();

    assert_eq!(fs::read(backup_path(&path)).unwrap(), image());
    let ratio = f32_at(&fs::read(&path).unwrap(), 0x100);
    assert_eq!(ratio, 2560.0 / 1080.0);
}

#[test]
fn dry_run_leaves_file_alone() {
    let (_dir, path) = setup();
    let set = profiles();

    let report = patch_file(
        &path,
        set.get("Offsets").unwrap(),
        Settings::new(1920, 1080, 1.0).unwrap(),
        FileOptions {
            backup: true,
            dry_run: true,
        },
    )
    .unwrap();

    assert_eq!(report.applied(), 2);
    assert_eq!(fs::read(&path).unwrap(), image());
    assert!(!backup_path(&path).exists());
}

#[test]
fn same_aspect_keeps_fov_exactly() {
    let (_dir, path) = setup();
    let set = profiles();

    patch_file(
        &path,
        set.get("Offsets").unwrap(),
        Settings::new(800, 600, 1.0).unwrap(),
        FileOptions::default(),
    )
    .unwrap();

    let data = fs::read(&path).unwrap();
    assert_eq!(f32_at(&data, 0x46).to_bits(), 90.0f32.to_bits());
    assert_eq!(f32_at(&data, 0x100).to_bits(), (800.0f32 / 600.0).to_bits());
}
