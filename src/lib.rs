pub mod asm;
pub mod ast;
pub mod ir;

use lalrpop_util::lalrpop_mod;

lalrpop_mod!(pub grammar);
