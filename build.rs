use std::process::Command;

/// 运行外部命令并取其标准输出，失败时返回 "unknown"
fn capture(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn env_or_unknown(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| "unknown".to_string())
}

fn main() {
    let stamps = [
        ("GIT_COMMIT", capture("git", &["rev-parse", "--short", "HEAD"])),
        ("GIT_COMMIT_FULL", capture("git", &["rev-parse", "HEAD"])),
        // 构建脚本不依赖 chrono，借用 date 命令
        ("BUILD_TIME", capture("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"])),
        ("BUILD_TARGET", env_or_unknown("TARGET")),
        ("BUILD_PROFILE", env_or_unknown("PROFILE")),
    ];
    for (key, value) in stamps {
        println!("cargo:rustc-env=CBLOG_STATIC_{key}={value}");
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/");
}
