//! Monitor command scenarios: parsing, page-table inspection, and the raw
//! mapping-edit surface.

use ucow::{
    addressing::{PAGE_SIZE, Va},
    env::{EnvId, EnvServices},
    machine::Machine,
    monitor::Monitor,
    page_table::{FrameId, PteFlags},
};

fn setup() -> (Machine, EnvId) {
    let mut m = Machine::new();
    let env = m.env_create();
    (m, env)
}

fn alloc(m: &mut Machine, env: EnvId, addr: usize) -> FrameId {
    let va = Va::new(addr).unwrap();
    m.env(env)
        .page_alloc(env, va, PteFlags::P | PteFlags::RW | PteFlags::US)
        .unwrap();
    m.mapping(env, va.page_number()).unwrap().frame().unwrap()
}

fn run(m: &mut Machine, env: EnvId, line: &str) -> String {
    let mut out = String::new();
    Monitor::new(m, env).runcmd(line, &mut out).unwrap();
    out
}

#[test]
fn showmappings_reports_one_page() {
    let (mut m, env) = setup();
    let frame = alloc(&mut m, env, 0x5000);

    let out = run(&mut m, env, "showmappings 0x5000");
    let expected = format!(
        "va:0x00005000 frame:{:#x} offset:0x0 User:1 Writable:1 Dirty:0 PS:0\n",
        frame.into_usize()
    );
    assert_eq!(out, expected);
}

#[test]
fn showmappings_reports_unmapped_pages() {
    let (mut m, env) = setup();
    let out = run(&mut m, env, "showmappings 0x9000");
    assert_eq!(out, "va: 0x00009000  Not Mapped\n");
}

#[test]
fn showmappings_walks_a_range() {
    let (mut m, env) = setup();
    alloc(&mut m, env, 0x5000);
    alloc(&mut m, env, 0x7000);

    let out = run(&mut m, env, "showmappings 0x5000 0x7000");
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("va:0x00005000"));
    assert_eq!(lines[1], "va: 0x00006000  Not Mapped");
    assert!(lines[2].starts_with("va:0x00007000"));
}

#[test]
fn setmappings_overwrites_permissions() {
    let (mut m, env) = setup();
    alloc(&mut m, env, 0x5000);

    // P | US, dropping the write bit.
    let out = run(&mut m, env, "setmappings 0x5000 0x5000 0x5");
    assert!(out.contains("Writable:0"));
    let flags = m
        .mapping(env, Va::new(0x5000).unwrap().page_number())
        .unwrap()
        .flags();
    assert_eq!(flags, PteFlags::P | PteFlags::US);
}

#[test]
fn setmappings_rejects_bad_ranges() {
    let (mut m, env) = setup();
    let out = run(&mut m, env, "setmappings 0x7000 0x5000 0x5");
    assert!(out.starts_with("Usage: setmappings"));
}

#[test]
fn dump_prints_memory_words() {
    let (mut m, env) = setup();
    alloc(&mut m, env, 0x5000);
    let value = 0x1122_3344_5566_7788usize;
    m.env(env)
        .write_bytes(Va::new(0x5000).unwrap(), &value.to_le_bytes())
        .unwrap();

    let out = run(&mut m, env, "dump 0x5000 2");
    assert!(out.contains(&format!("Value at 0x5000 is {:#018x}", value)));
    assert!(out.contains(&format!("Value at 0x5008 is {:#018x}", 0)));
}

#[test]
fn dump_reports_unmapped_ranges() {
    let (mut m, env) = setup();
    let out = run(&mut m, env, "dump 0x9000 1");
    assert!(out.contains(&format!("va: 0x9000 - {:#x} not mapped", 0x9000 + PAGE_SIZE)));
}

#[test]
fn dump_survives_the_last_page() {
    // The page boundary after the last page does not exist; the walk
    // must stop at the requested end instead of wrapping.
    let (mut m, env) = setup();
    let out = run(&mut m, env, "dump 0xfffffffffffff000 1");
    assert!(out.contains("not mapped"));
    assert!(!out.contains("Value at"));
}

#[test]
fn help_lists_every_command() {
    let (mut m, env) = setup();
    let out = run(&mut m, env, "help");
    for name in ["help", "showmappings", "setmappings", "dump"] {
        assert!(out.lines().any(|l| l.starts_with(name)));
    }
}

#[test]
fn unknown_commands_are_reported() {
    let (mut m, env) = setup();
    let out = run(&mut m, env, "frobnicate 1 2");
    assert_eq!(out, "Unknown command 'frobnicate'\n");
}

#[test]
fn blank_lines_are_ignored() {
    let (mut m, env) = setup();
    let out = run(&mut m, env, "   ");
    assert!(out.is_empty());
}

#[test]
fn banner_greets() {
    let mut out = String::new();
    Monitor::banner(&mut out).unwrap();
    assert!(out.starts_with("Welcome to the kernel monitor!"));
}
