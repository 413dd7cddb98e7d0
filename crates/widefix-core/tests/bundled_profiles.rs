//! The shipped `widefix.toml` stays loadable.

use widefix_core::runtime::load_host_config;
use widefix_core::{FixConfig, NoDisplay, ProfileSet};

const BUNDLED: &str = include_str!("../../../profiles/widefix.toml");

#[test]
fn bundled_file_parses() {
    let set = ProfileSet::from_toml_str(BUNDLED).unwrap();
    assert_eq!(set.profiles.len(), 2);

    let racer = set.select("racer.exe").unwrap();
    assert_eq!(racer.module_name(), "RacerEngine.dll");
    assert!(racer.has_hooks());
    assert!(!set.select("arena.exe").unwrap().has_hooks());
}

#[test]
fn bundled_settings() {
    let settings = FixConfig::from_toml_str(BUNDLED).unwrap().resolve(&NoDisplay);
    assert!(settings.enabled);
    assert_eq!(settings.resolution.width(), 2560);
    assert_eq!(settings.resolution.height(), 1080);
    assert_eq!(settings.fov_factor, 1.0);

    let (_, profile) = load_host_config(BUNDLED, r"D:\Steam\Racer\Racer.exe").unwrap();
    assert_eq!(profile.fixes.len(), 3);
}
