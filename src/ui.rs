const BANNER_WIDTH: usize = 72;
const KEY_WIDTH: usize = 16;
const LOGO: &[&str] = &[
    "  ____  __  __  ____  _     ",
    " |  _ \\ \\ \\/ / / ___|| |    ",
    " | |_) | \\  / | |    | |    ",
    " |  _ <  /  \\ | |___ | |___ ",
    " |_| \\_\\/_/\\_\\ \\____||_____|",
];

pub(crate) fn startup_banner(title: &str, subtitle: &str, lines: &[(&str, String)]) {
    let border = "=".repeat(BANNER_WIDTH);
    let divider = "-".repeat(BANNER_WIDTH);
    println!();
    println!("{border}");
    for line in LOGO {
        println!("{:^width$}", line, width = BANNER_WIDTH);
    }
    println!("{divider}");
    println!("{:^width$}", title, width = BANNER_WIDTH);
    println!("{:^width$}", subtitle, width = BANNER_WIDTH);
    println!("{border}");
    key_values(lines);
    println!("{border}");
    println!();
}

/// Prints an aligned key/value block without the banner chrome.
pub(crate) fn key_values(lines: &[(&str, String)]) {
    for (key, value) in lines {
        println!(
            "  {:<key_width$} {}",
            format!("{key}:"),
            value,
            key_width = KEY_WIDTH
        );
    }
}

pub(crate) fn info(tag: &str, message: impl AsRef<str>) {
    println!("{} {}", prefix("INFO", tag), message.as_ref());
}

pub(crate) fn success(tag: &str, message: impl AsRef<str>) {
    println!("{} {}", prefix(" OK ", tag), message.as_ref());
}

pub(crate) fn warn(tag: &str, message: impl AsRef<str>) {
    eprintln!("{} {}", prefix("WARN", tag), message.as_ref());
}

pub(crate) fn error(tag: &str, message: impl AsRef<str>) {
    eprintln!("{} {}", prefix("ERR ", tag), message.as_ref());
}

fn prefix(level: &str, tag: &str) -> String {
    format!("[{level}][{tag:<8}]")
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let value = bytes as f64;
    if value >= KIB * KIB * KIB {
        return format!("{:.2} GiB", value / (KIB * KIB * KIB));
    }
    if value >= KIB * KIB {
        return format!("{:.2} MiB", value / (KIB * KIB));
    }
    if value >= KIB {
        return format!("{:.2} KiB", value / KIB);
    }
    format!("{bytes} B")
}
