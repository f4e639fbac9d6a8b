//! Programmatic IL module assembly.
//!
//! Hosts and tests build modules through this fluent layer instead of
//! hand-writing instruction structs. The builder tracks one insertion point
//! and allocates SSA ids against the current function's value-name table.

use crate::instruction::{Instr, Opcode, SourceLoc};
use crate::module::{BasicBlock, ExternDecl, Function, Global, Module, Param};
use crate::types::TypeKind;
use crate::value::Value;

/// Builds a [`Module`] function by function, block by block.
#[derive(Default)]
pub struct ModuleBuilder {
    module: Module,
    current_fn: Option<usize>,
    current_block: Option<usize>,
}

impl ModuleBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a global constant string.
    pub fn add_global(&mut self, name: impl Into<String>, init: impl Into<String>) -> &mut Self {
        self.module.globals.push(Global {
            name: name.into(),
            init: init.into(),
        });
        self
    }

    /// Declare an extern runtime helper signature.
    pub fn add_extern(
        &mut self,
        name: impl Into<String>,
        ret: TypeKind,
        params: impl Into<Vec<TypeKind>>,
    ) -> &mut Self {
        self.module.externs.push(ExternDecl {
            name: name.into(),
            ret,
            params: params.into(),
        });
        self
    }

    /// Start a new function and make it current.
    pub fn start_function(&mut self, name: impl Into<String>, ret: TypeKind) -> &mut Self {
        self.module.functions.push(Function {
            name: name.into(),
            ret,
            params: Vec::new(),
            blocks: Vec::new(),
            value_names: Vec::new(),
        });
        self.current_fn = Some(self.module.functions.len() - 1);
        self.current_block = None;
        self
    }

    fn func_mut(&mut self) -> &mut Function {
        let idx = self.current_fn.expect("no current function");
        &mut self.module.functions[idx]
    }

    /// Allocate a fresh SSA id with an empty debug name.
    pub fn reserve_temp(&mut self) -> u32 {
        let func = self.func_mut();
        func.value_names.push(String::new());
        (func.value_names.len() - 1) as u32
    }

    /// Allocate a fresh SSA id with a debug name.
    pub fn named_temp(&mut self, name: impl Into<String>) -> u32 {
        let func = self.func_mut();
        func.value_names.push(name.into());
        (func.value_names.len() - 1) as u32
    }

    /// Append a parameterless block and make it current.
    pub fn add_block(&mut self, label: impl Into<String>) -> usize {
        self.add_block_with_params(label, Vec::new())
    }

    /// Append a block with parameters and make it current.
    ///
    /// Each `(name, ty)` pair gets a fresh SSA id; retrieve them through
    /// [`ModuleBuilder::block_param`].
    pub fn add_block_with_params(
        &mut self,
        label: impl Into<String>,
        params: Vec<(&str, TypeKind)>,
    ) -> usize {
        let mut block_params = Vec::with_capacity(params.len());
        for (name, ty) in params {
            let id = self.named_temp(name);
            block_params.push(Param {
                name: name.to_string(),
                ty,
                id,
            });
        }
        let func = self.func_mut();
        func.blocks.push(BasicBlock {
            label: label.into(),
            params: block_params,
            instrs: Vec::new(),
            terminated: false,
        });
        let idx = func.blocks.len() - 1;
        self.current_block = Some(idx);
        idx
    }

    /// Redirect emission to an existing block.
    pub fn set_insert_point(&mut self, block: usize) {
        self.current_block = Some(block);
    }

    /// The i-th parameter of a block as an operand.
    pub fn block_param(&self, block: usize, index: usize) -> Value {
        let func = &self.module.functions[self.current_fn.expect("no current function")];
        Value::Temp(func.blocks[block].params[index].id)
    }

    /// Append a raw instruction to the current block.
    pub fn emit(&mut self, instr: Instr) -> &mut Self {
        let terminates = instr.op.is_terminator();
        let block_idx = self.current_block.expect("no insertion point");
        let func = self.func_mut();
        let block = &mut func.blocks[block_idx];
        block.instrs.push(instr);
        if terminates {
            block.terminated = true;
        }
        self
    }

    /// Emit a binary operation producing `dst`.
    pub fn emit_binary(
        &mut self,
        op: Opcode,
        ty: TypeKind,
        dst: u32,
        lhs: Value,
        rhs: Value,
    ) -> &mut Self {
        let mut instr = Instr::new(op);
        instr.result = Some(dst);
        instr.ty = ty;
        instr.operands = vec![lhs, rhs];
        self.emit(instr)
    }

    /// Emit a unary operation producing `dst`.
    pub fn emit_unary(&mut self, op: Opcode, ty: TypeKind, dst: u32, value: Value) -> &mut Self {
        let mut instr = Instr::new(op);
        instr.result = Some(dst);
        instr.ty = ty;
        instr.operands = vec![value];
        self.emit(instr)
    }

    /// Emit a call; `result` pairs the destination id with its type.
    pub fn emit_call(
        &mut self,
        callee: impl Into<String>,
        args: Vec<Value>,
        result: Option<(u32, TypeKind)>,
        loc: SourceLoc,
    ) -> &mut Self {
        let mut instr = Instr::new(Opcode::Call);
        instr.callee = Some(callee.into());
        instr.operands = args;
        instr.loc = loc;
        if let Some((id, ty)) = result {
            instr.result = Some(id);
            instr.ty = ty;
        }
        self.emit(instr)
    }

    /// Emit a return, with or without a value.
    pub fn emit_ret(&mut self, value: Option<Value>) -> &mut Self {
        let mut instr = Instr::new(Opcode::Ret);
        if let Some(value) = value {
            instr.operands.push(value);
        }
        self.emit(instr)
    }

    /// Emit an unconditional branch with arguments.
    pub fn emit_br(&mut self, label: impl Into<String>, args: Vec<Value>) -> &mut Self {
        let mut instr = Instr::new(Opcode::Br);
        instr.labels.push(label.into());
        instr.br_args.push(args);
        self.emit(instr)
    }

    /// Emit a conditional branch with per-target arguments.
    pub fn emit_cbr(
        &mut self,
        cond: Value,
        true_label: impl Into<String>,
        true_args: Vec<Value>,
        false_label: impl Into<String>,
        false_args: Vec<Value>,
    ) -> &mut Self {
        let mut instr = Instr::new(Opcode::CBr);
        instr.operands.push(cond);
        instr.labels.push(true_label.into());
        instr.labels.push(false_label.into());
        instr.br_args.push(true_args);
        instr.br_args.push(false_args);
        self.emit(instr)
    }

    /// Emit a `switch.i32` with a default and explicit cases.
    pub fn emit_switch(
        &mut self,
        scrutinee: Value,
        default_label: impl Into<String>,
        cases: Vec<(i32, String)>,
    ) -> &mut Self {
        let mut instr = Instr::new(Opcode::SwitchI32);
        instr.operands.push(scrutinee);
        instr.labels.push(default_label.into());
        instr.br_args.push(Vec::new());
        for (value, label) in cases {
            instr.operands.push(Value::int(value as i64));
            instr.labels.push(label);
            instr.br_args.push(Vec::new());
        }
        self.emit(instr)
    }

    /// Emit `eh.push` targeting a handler label.
    pub fn emit_eh_push(&mut self, handler: impl Into<String>) -> &mut Self {
        let mut instr = Instr::new(Opcode::EhPush);
        instr.labels.push(handler.into());
        self.emit(instr)
    }

    /// Emit `eh.pop`.
    pub fn emit_eh_pop(&mut self) -> &mut Self {
        self.emit(Instr::new(Opcode::EhPop))
    }

    /// Finish and take the module.
    pub fn finish(&mut self) -> Module {
        std::mem::take(&mut self.module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_blocks_and_temps() {
        let mut b = ModuleBuilder::new();
        b.start_function("main", TypeKind::I64);
        b.add_block("entry");
        let t0 = b.reserve_temp();
        b.emit_binary(
            Opcode::Add,
            TypeKind::I64,
            t0,
            Value::int(1),
            Value::int(2),
        );
        b.emit_ret(Some(Value::temp(t0)));
        let module = b.finish();

        let func = module.function("main").unwrap();
        assert_eq!(func.blocks.len(), 1);
        assert_eq!(func.blocks[0].instrs.len(), 2);
        assert!(func.blocks[0].terminated);
        assert_eq!(func.value_names.len(), 1);
    }

    #[test]
    fn test_block_params_get_ids() {
        let mut b = ModuleBuilder::new();
        b.start_function("f", TypeKind::I64);
        b.add_block_with_params("entry", vec![("x", TypeKind::I64), ("s", TypeKind::Str)]);
        assert_eq!(b.block_param(0, 0), Value::Temp(0));
        assert_eq!(b.block_param(0, 1), Value::Temp(1));
        let module = b.finish();
        assert_eq!(module.functions[0].value_names, vec!["x", "s"]);
    }
}
