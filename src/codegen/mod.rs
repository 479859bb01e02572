//! Back end: instruction graph, register mapping, save bubbling, frame
//! layout and the replay checker for mapped programs.

pub mod bubbling;
pub mod checker;
pub mod frame;
pub mod instruction_graph;
pub mod mapper;

pub use bubbling::bubble_saves;
pub use checker::verify;
pub use frame::FrameLayout;
pub use instruction_graph::{InstIdx, InstKind, Instruction, InstructionGraph};
pub use mapper::{map_registers, OperatorMapping, RegisterMap, Shuffle};
