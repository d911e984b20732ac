use std::env::args;

use eyre::Result;
use memctrl_sim::main_inner;

fn main() -> Result<()> {
    main_inner(args())
}
