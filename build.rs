use std::process::Command;

fn main() {
    // git version for the startup banner
    let git_hash = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .filter(|hash| !hash.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_HASH={}", git_hash);
    println!("cargo:rerun-if-changed=.git/HEAD");

    // the default messenger shells out to the platform scripts
    let python_check = Command::new("python3")
        .arg("--version")
        .output();

    if python_check.is_err() {
        println!("cargo:warning=python3 not found in PATH, the script messenger will not work");
    }
}
