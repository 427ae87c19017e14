use std::{error::Error, io::Read, ptr::NonNull};

use libc::sbrk;
use rbtalloc::{ArenaProvider, SbrkArena, TreeAllocator};

/// Waits until the user presses ENTER.
/// Handy for inspecting the process with `pmap` or `gdb` between steps.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints the current program break using `sbrk(0)`.
fn print_program_break(label: &str) {
  println!(
    "[{}] PID = {}, program break (sbrk(0)) = {:?}",
    label,
    std::process::id(),
    unsafe { sbrk(0) },
  );
}

fn print_alloc(
  heap: &TreeAllocator<SbrkArena>,
  size: usize,
  ptr: NonNull<u8>,
) {
  println!(
    "  requested {size} bytes -> {ptr:p} ({} usable, addr % 16 = {})",
    unsafe { heap.usable_size(ptr) },
    ptr.as_ptr().addr() % 16
  );
}

fn print_heap(heap: &TreeAllocator<SbrkArena>) {
  for block in heap.blocks() {
    println!(
      "  {:#x} {:>6} bytes {}",
      block.addr,
      block.size,
      match (block.free, block.is_tracked()) {
        (false, _) => "allocated",
        (true, true) => "free (in tree)",
        (true, false) => "free (fragment)",
      }
    );
  }
  println!("  {}", heap.check(false));
}

fn main() -> Result<(), Box<dyn Error>> {
  print_program_break("start");

  let mut heap = TreeAllocator::new(SbrkArena::new()?)?;
  println!("\n[0] Allocator initialized, arena is {} bytes", heap.arena().len());
  print_program_break("after init");
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 1) A small allocation grows the arena by exactly one block.
  // --------------------------------------------------------------------
  let first = heap.allocate(40)?;
  println!("\n[1] Allocate 40 bytes");
  print_alloc(&heap, 40, first);
  unsafe { first.cast::<u32>().write(0xDEAD_BEEF) };
  print_heap(&heap);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 2) A large allocation moves the program break.
  // --------------------------------------------------------------------
  let big = heap.allocate(64 * 1024)?;
  println!("\n[2] Allocate 64 KiB");
  print_alloc(&heap, 64 * 1024, big);
  print_program_break("after large alloc");
  print_heap(&heap);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 3) Freeing the first block links it into the free-block tree, and the
  //    next allocation of the same size reuses it.
  // --------------------------------------------------------------------
  unsafe { heap.deallocate(first)? };
  println!("\n[3] Deallocated {first:p}");
  print_heap(&heap);

  let reused = heap.allocate(40)?;
  println!(
    "[3] allocate(40) -> {reused:p}: {}",
    if reused == first {
      "reused the freed block"
    } else {
      "allocated somewhere else"
    }
  );
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 4) Shrinking in place splits the tail off as a new free block.
  // --------------------------------------------------------------------
  let shrunk = unsafe { heap.resize(Some(big), 1024)? }.ok_or("resize freed the block")?;
  println!("\n[4] Resize 64 KiB -> 1 KiB, still at {shrunk:p}");
  print_heap(&heap);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 5) Freeing neighbors coalesces them into a single free block.
  // --------------------------------------------------------------------
  unsafe {
    heap.deallocate(reused)?;
    heap.deallocate(shrunk)?;
  }
  println!("\n[5] Freed everything");
  print_heap(&heap);

  let stats = heap.stats();
  println!(
    "[5] {} of {} arena bytes free in {} tree block(s)",
    stats.free_bytes(),
    stats.arena_bytes,
    stats.tracked_blocks
  );

  println!("\n[6] End of example. The arena is never shrunk; the OS reclaims it on exit.");
  Ok(())
}
