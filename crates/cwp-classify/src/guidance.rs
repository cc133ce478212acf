//! Submitter-facing remediation text.

pub const UNTERMINATED: &str = "\
When trying to test your submission, the testing code did not terminate within the time limit.

Either your code runs a very lengthy calculation, or it is stuck in an infinite loop. We cannot
assess your code if it does not return.

Please find where it gets stuck, fix it and resubmit. If this makes no sense to you, please get
in touch with a demonstrator or the laboratory leader.";

pub const IMPORT_FAILED: &str = "
When trying to import your submission we encountered an error, and as a result every test has
failed. Likely causes are a syntax or indentation error, non-ASCII characters, or code that runs
at import time and fails (for example reading a data file that only exists on your computer).

Before submitting:

- run the file on its own and check that no errors are reported,
- do not rely on data files that are not part of the submission,
- remove characters that are not ASCII, or declare the file encoding on the first line,
  for example `# coding=utf-8`.

If this does not match what you see, please contact a demonstrator or the laboratory leader.";

pub const PARSE_ERROR: &str = "\
An error occurred while reading the results of the tests. This may be caused by your submission
or by a bug in the testing system. The laboratory leader has been informed.

Please make sure your file runs without errors (for example `python MYFILE.py`) before
submitting it. If you are submitting C code, make sure it compiles without errors.";

pub const VIOLATION: &str = "\
Your code attempted an operation that is not permitted while testing (for example opening files
or network connections it is not allowed to use). The run was stopped and the tests could not be
completed. Please remove such operations and resubmit.";

pub const MEMORY_ERROR: &str = "\
While testing your code Python reported a MemoryError: your code tried to use more memory than is
available to the test. This is often caused by building very large lists or by loops that never
stop growing a data structure. The laboratory leader has been sent a copy of this report.";

pub const INTERNAL_ERROR: &str = "\
An internal error occurred while testing your submission. The laboratory leader has been informed
and will arrange for it to be tested again once the problem is fixed. If you do not hear back,
please contact them; there is no need to resubmit.";
