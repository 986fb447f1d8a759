// Embed the git hash for the startup log line. No git, no hash.
fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    if let Ok(output) = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
    {
        if output.status.success() {
            if let Ok(s) = String::from_utf8(output.stdout) {
                println!("cargo:rustc-env=AUTOENC_GIT_HASH={}", s.trim());
            }
        }
    }
}
