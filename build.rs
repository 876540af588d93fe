//! Build script for unifw
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! for the `unifw version` subcommand.

fn main() {
    // Re-run build if the elevation override changes packaging defaults
    println!("cargo:rerun-if-env-changed=UNIFW_ELEVATION_METHOD");

    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
