use std::fmt::Write;

use super::kind::{Arity, NodeKind};
use super::node::NodeRef;
use super::symtab::SymbolTable;
use super::ValueFormat;

/// Render an AST subtree as s-expression text, one node per line with
/// two-space indentation. Inverse-direction parsing is out of scope;
/// this output is for tools and diagnostics.
pub fn write_text(symtab: &SymbolTable, nd: NodeRef) -> String {
    let mut out = String::new();
    write_node(symtab, nd, 0, &mut out);
    out
}

fn write_node(symtab: &SymbolTable, nd: NodeRef, indent: usize, out: &mut String) {
    for _ in 0..indent {
        out.push_str("  ");
    }
    let kind = symtab.kind(nd);
    match kind.arity() {
        Arity::Symbol => match symtab.symbol_id(nd) {
            Some(id) => {
                let _ = writeln!(out, "${}", symtab.symbol_name(id));
            }
            // Malformed payload; render a placeholder rather than die
            // inside a diagnostic printer.
            None => {
                let _ = writeln!(out, "$?");
            }
        },
        Arity::Integer => {
            let Some(value) = symtab.int_value(nd) else {
                let _ = writeln!(out, "({})", kind.sexp_name());
                return;
            };
            if value.is_default {
                let _ = writeln!(out, "({})", kind.sexp_name());
            } else {
                match value.format {
                    ValueFormat::Decimal => {
                        let _ = writeln!(out, "({} {})", kind.sexp_name(), value.value);
                    }
                    ValueFormat::SignedDecimal => {
                        let _ =
                            writeln!(out, "({} {})", kind.sexp_name(), value.value as i64);
                    }
                    ValueFormat::Hexadecimal => {
                        let _ = writeln!(out, "({} {:#x})", kind.sexp_name(), value.value);
                    }
                }
            }
        }
        Arity::Nullary if kind == NodeKind::Stream => {
            let _ = writeln!(out, "(stream)");
        }
        Arity::Nullary => {
            let _ = writeln!(out, "({})", kind.sexp_name());
        }
        _ if symtab.num_kids(nd) == 0 => {
            let _ = writeln!(out, "({})", kind.sexp_name());
        }
        _ => {
            let _ = writeln!(out, "({}", kind.sexp_name());
            for index in 0..symtab.num_kids(nd) {
                write_node(symtab, symtab.kid(nd, index), indent + 1, out);
            }
            for _ in 0..indent {
                out.push_str("  ");
            }
            out.push_str(")\n");
        }
    }
}
