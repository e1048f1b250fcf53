// This module reads the line-oriented text form of a Graph, the same syntax its Display
// implementation prints. Each non-empty line declares one instruction: an optional list of
// output names, the op name, the input names and key=value attributes. Everything after a
// semicolon is a comment. Parsing takes two passes. The first assigns every output name to
// its (instruction, slot) pair so that a loop head may refer to the back-edge produced by a
// later conditional jump; the second builds the instructions with their inputs resolved.
// The number of names on the left of `=` is the number of outputs of the instruction.
// Every error carries the 1-based line it was found on.

//! Text IR parser.
//!
//! ```text
//! %p = parameter
//! %x = load %p offset=0
//! %c = scalar value=2
//! %y = mul %x, %c
//! %s = store %y
//! result %s
//! ```

use super::error::{CompileError, CompileResult};
use super::ir::{ConvShape, ElementwiseOp, Graph, Instruction, OpKind, Value};
use hashbrown::HashMap;
use std::str::FromStr;

struct Line<'a> {
    number: usize,
    outputs: Vec<&'a str>,
    op: &'a str,
    inputs: Vec<&'a str>,
    attrs: HashMap<&'a str, &'a str>,
}

fn parse_error(line: usize, reason: impl Into<String>) -> CompileError {
    CompileError::Parse {
        line,
        reason: reason.into(),
    }
}

fn split_line(number: usize, text: &str) -> CompileResult<Option<Line<'_>>> {
    let text = text.split(';').next().unwrap_or("").trim();
    if text.is_empty() {
        return Ok(None);
    }

    let (lhs, rhs) = match text.split_once('=') {
        Some((lhs, rhs)) if lhs.trim_start().starts_with('%') => (lhs, rhs),
        _ => ("", text),
    };
    let outputs: Vec<&str> = lhs
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect();
    if let Some(bad) = outputs.iter().find(|name| !name.starts_with('%')) {
        return Err(parse_error(number, format!("output name `{bad}` must start with %")));
    }

    let mut tokens = rhs
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty());
    let op = tokens
        .next()
        .ok_or_else(|| parse_error(number, "missing op name"))?;

    let mut inputs = Vec::new();
    let mut attrs = HashMap::new();
    for token in tokens {
        if token.starts_with('%') {
            if !attrs.is_empty() {
                return Err(parse_error(number, format!("input {token} after attributes")));
            }
            inputs.push(token);
        } else if let Some((key, value)) = token.split_once('=') {
            if attrs.insert(key, value).is_some() {
                return Err(parse_error(number, format!("duplicate attribute `{key}`")));
            }
        } else {
            return Err(parse_error(number, format!("unexpected token `{token}`")));
        }
    }

    Ok(Some(Line {
        number,
        outputs,
        op,
        inputs,
        attrs,
    }))
}

fn allowed_attrs(op: &str) -> &'static [&'static str] {
    match op {
        "load" | "scalar_load" => &["offset", "post_increment"],
        "store" | "scalar_store" => &["offset"],
        "broadcast_load" => &["post_increment"],
        "scalar" => &["value"],
        "loop" => &["id", "iterations"],
        "auto_loop" | "label" => &["id"],
        "conv" => &["kh", "kw", "packs", "row_stride", "col_stride"],
        _ => &[],
    }
}

impl Line<'_> {
    fn attr<T: FromStr>(&self, key: &str) -> CompileResult<Option<T>> {
        self.attrs
            .get(key)
            .map(|raw| {
                raw.parse().map_err(|_| {
                    parse_error(self.number, format!("invalid value `{raw}` for `{key}`"))
                })
            })
            .transpose()
    }

    fn required<T: FromStr>(&self, key: &str) -> CompileResult<T> {
        self.attr(key)?.ok_or_else(|| {
            parse_error(
                self.number,
                format!("`{}` requires attribute `{key}`", self.op),
            )
        })
    }

    fn check_attrs(&self) -> CompileResult<()> {
        let allowed = allowed_attrs(self.op);
        match self.attrs.keys().find(|key| !allowed.contains(*key)) {
            Some(key) => Err(parse_error(
                self.number,
                format!("unknown attribute `{key}` for `{}`", self.op),
            )),
            None => Ok(()),
        }
    }

    fn kind(&self) -> CompileResult<OpKind> {
        self.check_attrs()?;
        let kind = match self.op {
            "parameter" => OpKind::Parameter,
            "result" => OpKind::Result,
            "load" | "scalar_load" => {
                let offset = self.attr("offset")?.unwrap_or(0);
                let post_increment = self.attr("post_increment")?.unwrap_or(false);
                if self.op == "load" {
                    OpKind::Load {
                        offset,
                        post_increment,
                    }
                } else {
                    OpKind::ScalarLoad {
                        offset,
                        post_increment,
                    }
                }
            }
            "store" => OpKind::Store {
                offset: self.attr("offset")?.unwrap_or(0),
            },
            "scalar_store" => OpKind::ScalarStore {
                offset: self.attr("offset")?.unwrap_or(0),
            },
            "broadcast_load" => OpKind::BroadcastLoad {
                post_increment: self.attr("post_increment")?.unwrap_or(false),
            },
            "broadcast_move" => OpKind::BroadcastMove,
            "split" => OpKind::Split,
            "scalar" => OpKind::Scalar(self.required("value")?),
            "loop" => OpKind::Loop {
                id: self.required("id")?,
                iterations: self.required("iterations")?,
            },
            "auto_loop" => OpKind::AutoLoop {
                id: self.required("id")?,
            },
            "cjump" => OpKind::ConditionalJump,
            "label" => OpKind::Label {
                id: self.required("id")?,
            },
            "conv" => OpKind::ConvolutionKernel(ConvShape {
                kernel_h: self.required("kh")?,
                kernel_w: self.required("kw")?,
                channel_packs: self.required("packs")?,
                row_stride: self.required("row_stride")?,
                col_stride: self.required("col_stride")?,
            }),
            name => match ElementwiseOp::from_name(name) {
                Some(op) => OpKind::Elementwise(op),
                None => return Err(parse_error(self.number, format!("unknown op `{name}`"))),
            },
        };
        Ok(kind)
    }
}

/// Parse the text form of a graph.
pub fn parse_graph(source: &str) -> CompileResult<Graph> {
    let lines = source
        .lines()
        .enumerate()
        .filter_map(|(index, text)| split_line(index + 1, text).transpose())
        .collect::<CompileResult<Vec<_>>>()?;

    let mut names: HashMap<&str, Value> = HashMap::new();
    for (id, line) in lines.iter().enumerate() {
        for (slot, &name) in line.outputs.iter().enumerate() {
            if names.insert(name, Value::new(id, slot as u32)).is_some() {
                return Err(parse_error(line.number, format!("{name} is defined twice")));
            }
        }
    }

    let mut insts = Vec::with_capacity(lines.len());
    for line in &lines {
        let inputs = line
            .inputs
            .iter()
            .map(|name| {
                names
                    .get(name)
                    .copied()
                    .ok_or_else(|| parse_error(line.number, format!("{name} is not defined")))
            })
            .collect::<CompileResult<Vec<_>>>()?;
        insts.push(Instruction::new(
            line.kind()?,
            inputs,
            line.outputs.len() as u32,
        ));
    }
    log::debug!("parsed {} instructions", insts.len());

    Graph::from_instructions(insts)
}

impl FromStr for Graph {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_graph(s)
    }
}
