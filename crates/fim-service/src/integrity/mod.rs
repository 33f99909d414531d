pub mod evaluator;
pub mod realtime;
pub mod scan_loop;
pub mod scanner;
pub mod sync;
pub mod whodata;
