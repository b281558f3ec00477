//! Child environments for the two privileged channels.

use std::collections::BTreeMap;

use crate::layout::BinaryLayout;

/// Class-path style variables that must never reach the mediated helper.
pub const STRIPPED_VARS: [&str; 4] = [
    "CLASSPATH",
    "BOOTCLASSPATH",
    "SYSTEMSERVERCLASSPATH",
    "DEX_PATH",
];

pub const OS_ROOT: &str = "/system";
pub const DATA_ROOT: &str = "/data";
pub const RUNTIME_ROOT: &str = "/apex/com.android.runtime";

const RUNTIME_LIBS_64: &str = "/apex/com.android.runtime/lib64:/apex/com.android.art/lib64";
const RUNTIME_LIBS_32: &str = "/apex/com.android.runtime/lib:/apex/com.android.art/lib";

/// System directories appended after the private bin dir on the direct channel.
pub const DIRECT_PATH_TAIL: &str = "/system/bin:/system/xbin";

/// Full environment for the mediated helper.
///
/// Starts from `inherited`, drops [`STRIPPED_VARS`], pins the OS/data/runtime
/// roots, puts the runtime libraries for the layout's ABI ahead of the bin
/// dir in `LD_LIBRARY_PATH` and the bin dir first in `PATH`. Deterministic
/// for a given layout and input.
pub fn build_mediated_env<I>(layout: &BinaryLayout, inherited: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = inherited
        .into_iter()
        .filter(|(k, _)| !STRIPPED_VARS.contains(&k.as_str()))
        .collect();

    let bin = layout.bin_dir().display().to_string();

    env.insert("ANDROID_ROOT".into(), OS_ROOT.into());
    env.insert("ANDROID_DATA".into(), DATA_ROOT.into());
    env.insert("ANDROID_RUNTIME_ROOT".into(), RUNTIME_ROOT.into());

    let runtime_libs = if layout.abi().is_64bit() {
        RUNTIME_LIBS_64
    } else {
        RUNTIME_LIBS_32
    };
    env.insert("LD_LIBRARY_PATH".into(), format!("{runtime_libs}:{bin}"));

    let path = match env.get("PATH").filter(|p| !p.is_empty()) {
        Some(parent) => format!("{bin}:{parent}"),
        None => bin,
    };
    env.insert("PATH".into(), path);
    env
}

/// Overrides for the direct channel: only a constrained `PATH`.
pub fn build_direct_env(layout: &BinaryLayout) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        "PATH".to_string(),
        format!("{}:{}", layout.bin_dir().display(), DIRECT_PATH_TAIL),
    );
    env
}
