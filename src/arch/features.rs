//! Target description documents served through `qXfer:features:read`.
//!
//! One static document per guest execution width. Register numbers are
//! pinned explicitly so the debugger's view matches the transcoding tables
//! in [`super::registers`].

use std::fmt::Write;
use std::sync::OnceLock;

/// Resolves a feature annex to its document. `target.xml` selects the
/// document for the reporting thread's execution width.
pub fn lookup(annex: &str, aarch32: bool) -> Option<&'static str> {
    match annex {
        "target.xml" => Some(if aarch32 { target32() } else { target64() }),
        "target64.xml" => Some(target64()),
        "target32.xml" => Some(target32()),
        _ => None,
    }
}

fn target64() -> &'static str {
    static XML: OnceLock<String> = OnceLock::new();
    XML.get_or_init(build_target64)
}

fn target32() -> &'static str {
    static XML: OnceLock<String> = OnceLock::new();
    XML.get_or_init(build_target32)
}

fn build_target64() -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\"?>\n");
    xml.push_str("<!DOCTYPE target SYSTEM \"gdb-target.dtd\">\n");
    xml.push_str("<target version=\"1.0\">\n");
    xml.push_str("<architecture>aarch64</architecture>\n");

    xml.push_str("<feature name=\"org.gnu.gdb.aarch64.core\">\n");
    for i in 0..31 {
        let _ = writeln!(xml, "<reg name=\"x{i}\" bitsize=\"64\" type=\"int64\" regnum=\"{i}\"/>");
    }
    xml.push_str("<reg name=\"sp\" bitsize=\"64\" type=\"data_ptr\" regnum=\"31\"/>\n");
    xml.push_str("<reg name=\"pc\" bitsize=\"64\" type=\"code_ptr\" regnum=\"32\"/>\n");
    xml.push_str("<reg name=\"cpsr\" bitsize=\"32\" regnum=\"33\"/>\n");
    xml.push_str("</feature>\n");

    xml.push_str("<feature name=\"org.gnu.gdb.aarch64.fpu\">\n");
    for i in 0..32 {
        let _ = writeln!(
            xml,
            "<reg name=\"v{i}\" bitsize=\"128\" type=\"uint128\" regnum=\"{}\"/>",
            34 + i
        );
    }
    xml.push_str("<reg name=\"fpsr\" bitsize=\"32\" regnum=\"66\"/>\n");
    xml.push_str("<reg name=\"fpcr\" bitsize=\"32\" regnum=\"67\"/>\n");
    xml.push_str("</feature>\n");

    xml.push_str("</target>\n");
    xml
}

fn build_target32() -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\"?>\n");
    xml.push_str("<!DOCTYPE target SYSTEM \"gdb-target.dtd\">\n");
    xml.push_str("<target version=\"1.0\">\n");
    xml.push_str("<architecture>arm</architecture>\n");

    xml.push_str("<feature name=\"org.gnu.gdb.arm.core\">\n");
    for i in 0..13 {
        let _ = writeln!(xml, "<reg name=\"r{i}\" bitsize=\"32\" type=\"uint32\" regnum=\"{i}\"/>");
    }
    xml.push_str("<reg name=\"sp\" bitsize=\"32\" type=\"data_ptr\" regnum=\"13\"/>\n");
    xml.push_str("<reg name=\"lr\" bitsize=\"32\" regnum=\"14\"/>\n");
    xml.push_str("<reg name=\"pc\" bitsize=\"32\" type=\"code_ptr\" regnum=\"15\"/>\n");
    xml.push_str("<reg name=\"cpsr\" bitsize=\"32\" regnum=\"16\"/>\n");
    xml.push_str("</feature>\n");

    xml.push_str("<feature name=\"org.gnu.gdb.arm.neon\">\n");
    for i in 0..16 {
        let _ = writeln!(
            xml,
            "<reg name=\"q{i}\" bitsize=\"128\" type=\"uint128\" regnum=\"{}\"/>",
            17 + i
        );
    }
    for i in 0..32 {
        let _ = writeln!(
            xml,
            "<reg name=\"d{i}\" bitsize=\"64\" type=\"ieee_double\" regnum=\"{}\"/>",
            33 + i
        );
    }
    xml.push_str("<reg name=\"fpscr\" bitsize=\"32\" regnum=\"65\"/>\n");
    xml.push_str("</feature>\n");

    xml.push_str("</target>\n");
    xml
}
